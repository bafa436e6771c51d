//! Fuzz target for SSH packet parsing.
//!
//! Feeds arbitrary bytes to the packet parser and to the streaming decoder,
//! looking for panics, hangs and inconsistent results.
//!
//! Run with:
//! ```bash
//! cd crates/ssh
//! cargo +nightly fuzz run ssh_packet -- -max_total_time=300
//! ```

#![no_main]
use bytes::BytesMut;
use fynx_ssh::codec::PacketOpener;
use fynx_ssh::packet::Packet;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    // If parsing succeeds, the serialized form must parse to the same payload
    if let Ok(packet) = Packet::from_bytes(data) {
        let serialized = packet.to_bytes();
        let reparsed =
            Packet::from_bytes(&serialized).expect("Round-trip parsing should never fail");
        assert_eq!(packet.payload(), reparsed.payload());
    }

    // The decoder must make progress or stop, never loop
    let mut opener = PacketOpener::new();
    let mut buf = BytesMut::from(data);
    while let Ok(Some(_)) = opener.decode(&mut buf) {}
});
