//! Embedded instrumentation blobs (§6). These are small, fixed
//! machine-code sequences the emulator's code generator may splice
//! into translated blocks; they contain no algorithmic content of
//! their own and are carried here unchanged from the source.

/// Decrement-and-compare sequence for the chain-count fast path. The
/// trailing conditional jump is appended by the code generator, not
/// included here.
pub const CHAIN_COUNT_MACHINE_CODE: [u8; 13] = [
    0xFF, 0x8D, 0xB4, 0x32, 0x01, 0x00, 0x83, 0xBD, 0xB4, 0x32, 0x01, 0x00, 0x00,
];

/// Indirect jump through an address adjacent to the instruction
/// itself, used by the `insert-jmx` block-start instrumentation.
pub const JMX_JUMP_MACHINE_CODE: [u8; 13] = [
    0x48, 0x8d, 0x05, 0x02, 0x00, 0x00, 0x00, 0xff, 0xd0, 0x48, 0x83, 0xc4, 0x08,
];

/// `insert-jmx` shifts the host IP at block entry by this many bytes;
/// it is the default `mapping_offset` when the flag is enabled and no
/// explicit offset was given on the command line.
pub const JMX_DEFAULT_MAPPING_OFFSET: u64 = 7;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blobs_have_expected_fixed_length() {
        assert_eq!(CHAIN_COUNT_MACHINE_CODE.len(), 13);
        assert_eq!(JMX_JUMP_MACHINE_CODE.len(), 13);
    }
}
