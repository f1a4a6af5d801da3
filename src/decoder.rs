//! Intel-PT-style packet decoder (§4.D). Turns a raw byte span into
//! an ordered list of guest PCs via the Address Map.
//!
//! State is stack-local per job: each decoder worker starts a fresh
//! [`DecoderState`] for every job and relies on the leading preamble
//! plus the PSB resynchronisation rule to pick back up wherever the
//! previous job's framing left off. The source mixed a shared mutable
//! `state` struct through a macro (`RETURN_IF`) that doubled as both
//! the parse result and the running decode state; here the parse step
//! returns a tagged [`PacketKind`] and the state updates happen in the
//! caller, one match arm at a time.

use crate::addr_map::{AddrMap, NO_MAPPING};
use crate::metrics::Metrics;
use crate::staging_ring::Job;

/// 16-byte PSB framing pattern: `0x02, 0x82` repeated eight times.
pub const PSB_PATTERN: [u8; 16] = [
    0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82, 0x02, 0x82,
];
const PSBEND: [u8; 2] = [0x02, 0x23];
const PIP_ESCAPE: [u8; 2] = [0x02, 0x43];
const MODE_OPCODE: u8 = 0x99;
const OVF: [u8; 2] = [0x02, 0xf3];

const TIP_OPCODE: u8 = 0x0d;
const TIP_PGE_OPCODE: u8 = 0x11;
const TIP_PGD_OPCODE: u8 = 0x01;
const FUP_OPCODE: u8 = 0x1d;
const TIP_OPCODE_MASK: u8 = 0x1f;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TipType {
    Tip,
    Pge,
    Pgd,
    Fup,
}

/// One of the packet kinds the hardware trace format may emit.
/// Every variant but `Tip` (and its PGE/PGD/FUP siblings) is
/// recognised only for bookkeeping the two sticky flags (§4.D);
/// this core does not otherwise act on TNT/CYC/MTC/etc payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketKind {
    Tnt,
    Tip(TipType),
    TipOutOfContext,
    Pip,
    Mode,
    TraceStop,
    Cbr,
    Tsc,
    Mtc,
    Tma,
    Vmcs,
    Ovf,
    Cyc,
    Psb,
    PsbEnd,
    Mnt,
    Pad,
    Ptw,
    Exstop,
    Mwait,
    Pwre,
    Pwrx,
    Bbp,
    Bip,
    Bep,
    Cfe,
    Evd,
    Unknown,
}

struct ParsedPacket {
    kind: PacketKind,
    consumed: usize,
    tip_ip: Option<u64>,
    /// Set when this `Unknown` came from a reserved TIP ip-bits class
    /// (§4.D's 011 and "others") rather than a genuinely unrecognised
    /// byte, so callers can count the two §7 error classes separately.
    reserved: bool,
}

impl ParsedPacket {
    fn simple(kind: PacketKind, consumed: usize) -> Self {
        Self {
            kind,
            consumed,
            tip_ip: None,
            reserved: false,
        }
    }
}

/// Decoder state local to one job. Never carried across jobs; a fresh
/// instance is created for each `decode_job` call.
pub struct DecoderState {
    current_ip: u64,
    previous_guest_ip: Option<u64>,
    last_tip_ip: u64,
    in_psb: bool,
    in_fup: bool,
    last_was_mode: bool,
    last_was_ovf: bool,
    last_ip_had_mapping: bool,
}

impl DecoderState {
    fn new() -> Self {
        Self {
            current_ip: 0,
            previous_guest_ip: None,
            last_tip_ip: 0,
            in_psb: false,
            in_fup: false,
            last_was_mode: false,
            last_was_ovf: false,
            last_ip_had_mapping: false,
        }
    }
}

/// Consumes `bytes` and appends discovered guest PCs to `job.trace`,
/// including the final end-of-job flush of any buffered PC (§4.D).
pub fn decode_job(bytes: &[u8], job: &mut Job, addr_map: &AddrMap) {
    decode_job_with_metrics(bytes, job, addr_map, None)
}

/// Same as [`decode_job`], additionally tallying the protocol-error
/// counters (§7) a worker loop wants for observability: unknown byte
/// sequences, reserved TIP compression classes, and address-map
/// misses. `metrics` is optional so unit tests can exercise the pure
/// decode path without a `Metrics` instance to hand.
pub fn decode_job_with_metrics(
    bytes: &[u8],
    job: &mut Job,
    addr_map: &AddrMap,
    metrics: Option<&Metrics>,
) {
    let mut state = DecoderState::new();
    run_decode_loop(bytes, &mut state, job, addr_map, metrics);
    if let Some(pc) = state.previous_guest_ip.take() {
        job.push_pc(pc);
    }
}

/// Runs the packet loop without the end-of-job flush. The one-step
/// delay in `log_basic_block` means the most recently seen guest PC is
/// always held back in `state.previous_guest_ip` rather than written
/// immediately — this is what lets the FUP/PGD discard rule retract
/// it. Split out so the delay behaviour itself (§8 scenarios 2 and 3)
/// can be observed independently of the final flush.
fn run_decode_loop(
    bytes: &[u8],
    state: &mut DecoderState,
    job: &mut Job,
    addr_map: &AddrMap,
    metrics: Option<&Metrics>,
) {
    let mut offset = match find_psb(bytes, 0) {
        Some(idx) => idx,
        None => {
            return;
        }
    };

    while offset < bytes.len() {
        let Some(parsed) = recognize_packet(bytes, offset, state.current_ip) else {
            break;
        };
        let next_offset = offset + parsed.consumed;

        match parsed.kind {
            PacketKind::Psb => {
                state.in_psb = true;
            }
            PacketKind::PsbEnd => {
                state.in_psb = false;
            }
            PacketKind::Tip(tip_type) => {
                if let Some(ip) = parsed.tip_ip {
                    handle_tip(state, tip_type, ip, addr_map, job, metrics);
                }
            }
            PacketKind::TipOutOfContext => {
                // ip_bits = 000: no IP payload, no IP update (§4.D).
            }
            PacketKind::Unknown => {
                if let Some(metrics) = metrics {
                    if parsed.reserved {
                        metrics.inc_reserved_packet();
                    } else {
                        metrics.inc_unknown_packet();
                    }
                }
            }
            _ => {}
        }

        state.last_was_mode = matches!(parsed.kind, PacketKind::Mode);
        state.last_was_ovf = matches!(parsed.kind, PacketKind::Ovf);

        offset = next_offset;

        // §4.D packet 1: once a PSB has carried us past this job's
        // declared end, stop. The next job's own resync-to-PSB picks
        // up exactly here, so this is the seam that keeps the overlap
        // bytes from being decoded twice (§5 "not duplicated output").
        if matches!(parsed.kind, PacketKind::Psb) && job.start_offset + offset as u64 > job.end_offset
        {
            break;
        }
    }
}

fn find_psb(bytes: &[u8], from: usize) -> Option<usize> {
    if bytes.len() < PSB_PATTERN.len() {
        return None;
    }
    (from..=bytes.len() - PSB_PATTERN.len()).find(|&i| bytes[i..i + PSB_PATTERN.len()] == PSB_PATTERN)
}

fn recognize_packet(bytes: &[u8], offset: usize, last_ip: u64) -> Option<ParsedPacket> {
    let remaining = bytes.len() - offset;

    if remaining >= PSB_PATTERN.len() && bytes[offset..offset + PSB_PATTERN.len()] == PSB_PATTERN {
        return Some(ParsedPacket::simple(PacketKind::Psb, PSB_PATTERN.len()));
    }

    if remaining >= 2 && bytes[offset] == PSBEND[0] && bytes[offset + 1] == PSBEND[1] {
        return Some(ParsedPacket::simple(PacketKind::PsbEnd, 2));
    }

    let opcode = bytes[offset];
    if let Some(tip_type) = tip_type_from_opcode(opcode) {
        return recognize_tip(bytes, offset, tip_type, last_ip);
    }

    if remaining >= 8 && bytes[offset] == PIP_ESCAPE[0] && bytes[offset + 1] == PIP_ESCAPE[1] {
        return Some(ParsedPacket::simple(PacketKind::Pip, 8));
    }

    if remaining >= 2 && opcode == MODE_OPCODE {
        return Some(ParsedPacket::simple(PacketKind::Mode, 2));
    }

    if remaining >= 2 && bytes[offset] == OVF[0] && bytes[offset + 1] == OVF[1] {
        return Some(ParsedPacket::simple(PacketKind::Ovf, 2));
    }

    Some(ParsedPacket::simple(PacketKind::Unknown, 1))
}

fn tip_type_from_opcode(opcode: u8) -> Option<TipType> {
    match opcode & TIP_OPCODE_MASK {
        TIP_OPCODE => Some(TipType::Tip),
        TIP_PGE_OPCODE => Some(TipType::Pge),
        TIP_PGD_OPCODE => Some(TipType::Pgd),
        FUP_OPCODE => Some(TipType::Fup),
        _ => None,
    }
}

/// ip_bits lives in the top 3 bits of the opcode byte (§4.D).
fn recognize_tip(
    bytes: &[u8],
    offset: usize,
    tip_type: TipType,
    last_ip: u64,
) -> Option<ParsedPacket> {
    let opcode = bytes[offset];
    let ip_bits = opcode >> 5;
    let remaining = bytes.len() - offset - 1;

    let payload_len = match ip_bits {
        0b000 => 0,
        0b001 => 2,
        0b010 => 4,
        0b100 => 6,
        0b110 => 8,
        _ => {
            // 011 and other reserved classes: abort the current
            // packet and continue, per §7 / Open Question 3.
            return Some(ParsedPacket {
                kind: PacketKind::Unknown,
                consumed: 1,
                tip_ip: None,
                reserved: true,
            });
        }
    };

    if remaining < payload_len {
        return None;
    }

    if payload_len == 0 {
        return Some(ParsedPacket::simple(PacketKind::TipOutOfContext, 1));
    }

    let payload = &bytes[offset + 1..offset + 1 + payload_len];
    let ip = reconstruct_ip(last_ip, payload);

    Some(ParsedPacket {
        kind: PacketKind::Tip(tip_type),
        consumed: 1 + payload_len,
        tip_ip: Some(ip),
        reserved: false,
    })
}

/// Substitutes the low `payload.len()` bytes with the packet's
/// payload (read as a big-endian value) and keeps the high
/// `8 - payload.len()` bytes from `last_ip` unchanged, per §4.D's
/// "substitute the low bytes from the packet, high bytes from the
/// previous IP" contract.
fn reconstruct_ip(last_ip: u64, payload: &[u8]) -> u64 {
    if payload.len() >= 8 {
        let mut value: u64 = 0;
        for &b in &payload[..8] {
            value = (value << 8) | b as u64;
        }
        return value;
    }

    let mut payload_value: u64 = 0;
    for &b in payload {
        payload_value = (payload_value << 8) | b as u64;
    }
    let low_bits = (payload.len() as u32) * 8;
    let high_mask = !0u64 << low_bits;
    (last_ip & high_mask) | payload_value
}

fn handle_tip(
    state: &mut DecoderState,
    tip_type: TipType,
    ip: u64,
    addr_map: &AddrMap,
    job: &mut Job,
    metrics: Option<&Metrics>,
) {
    if tip_type == TipType::Fup && !state.last_was_mode && !state.last_was_ovf {
        state.in_fup = true;
        return;
    }

    let mut was_in_fup = false;
    if matches!(tip_type, TipType::Pge | TipType::Pgd) && state.in_fup {
        state.in_fup = false;
        was_in_fup = true;
    }

    if state.in_fup {
        return;
    }

    if was_in_fup && state.last_ip_had_mapping && ip == state.last_tip_ip && ip == state.current_ip
    {
        // Discard the buffered (not yet committed) guest PC; it will
        // be re-emitted once the bound FUP's target resolves below.
        // Anything already written to job.trace is committed output
        // and must not be touched here.
        state.previous_guest_ip = None;
    }

    if tip_type == TipType::Fup
        && state.in_psb
        && ip == state.current_ip
        && state.last_tip_ip == state.current_ip
    {
        return;
    }

    state.last_tip_ip = ip;
    update_current_ip(state, ip, addr_map, job, metrics);
}

fn update_current_ip(
    state: &mut DecoderState,
    ip: u64,
    addr_map: &AddrMap,
    job: &mut Job,
    metrics: Option<&Metrics>,
) {
    state.current_ip = ip;
    let guest_pc = addr_map.lookup(ip);
    if guest_pc == NO_MAPPING {
        state.last_ip_had_mapping = false;
        if let Some(metrics) = metrics {
            metrics.inc_address_map_miss();
        }
        return;
    }
    state.last_ip_had_mapping = true;
    log_basic_block(state, guest_pc, job);
}

/// One-step delay: the PC is only appended once a *later* PC is
/// logged, so the FUP-binding discard rule above can still retract it.
fn log_basic_block(state: &mut DecoderState, guest_pc: u64, job: &mut Job) {
    match state.previous_guest_ip {
        None => state.previous_guest_ip = Some(guest_pc),
        Some(prev) => {
            job.push_pc(prev);
            state.previous_guest_ip = Some(guest_pc);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::staging_ring::Job;

    fn tip_packet(opcode: u8, payload: &[u8]) -> Vec<u8> {
        let mut v = vec![opcode];
        v.extend_from_slice(payload);
        v
    }

    fn full_ip_tip(opcode_base: u8, ip: u64) -> Vec<u8> {
        let opcode = opcode_base | (0b110 << 5);
        tip_packet(opcode, &ip.to_be_bytes())
    }

    #[test]
    fn empty_stream_produces_no_trace() {
        let map = AddrMap::new();
        let mut job = Job {
            start_offset: 0,
            end_offset: 0,
            trace: Vec::new(),
        };
        decode_job(&[], &mut job, &map);
        assert!(job.trace.is_empty());
    }

    /// §8 scenario 2: a single mapped TIP is held in the one-step delay
    /// and produces no trace entry *before* end-of-job; `decode_job`'s
    /// own flush (tested separately below) is what eventually emits it.
    #[test]
    fn single_psb_then_one_full_ip_tip_buffers_without_output() {
        let map = AddrMap::new();
        map.insert(0xAAAA, 0x1000);

        let mut bytes = PSB_PATTERN.to_vec();
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000));

        let mut state = DecoderState::new();
        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        run_decode_loop(&bytes, &mut state, &mut job, &map, None);
        assert!(job.trace.is_empty());
        assert_eq!(state.previous_guest_ip, Some(0xAAAA));
    }

    /// §8 scenario 3: two mapped TIPs; the first PC is flushed out of
    /// the delay by the second, the second stays buffered.
    #[test]
    fn two_full_ip_tips_emit_first_guest_pc() {
        let map = AddrMap::new();
        map.insert(0x1111, 0x1000);
        map.insert(0x2222, 0x2000);

        let mut bytes = PSB_PATTERN.to_vec();
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000));
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x2000));

        let mut state = DecoderState::new();
        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        run_decode_loop(&bytes, &mut state, &mut job, &map, None);
        assert_eq!(job.trace, vec![0x1111]);
        assert_eq!(state.previous_guest_ip, Some(0x2222));
    }

    #[test]
    fn compressed_tip_reconstructs_ip_from_reuse_window() {
        // ip_bits = 001: reuse the high 6 bytes of last_ip, payload
        // supplies the low 2 bytes.
        let last_ip = 0x1122_3344_5566_7788u64;
        let reconstructed = reconstruct_ip(last_ip, &[0xAA, 0xBB]);
        assert_eq!(reconstructed, 0x1122_3344_5566_AABB);
    }

    /// §8 scenario 5: an unbound FUP whose target equals `current_ip`
    /// (and had a mapping) gets bound by the following PGD, which
    /// clears the *buffered* G2 (not yet committed to `job.trace`) so
    /// it is re-logged rather than duplicated. G1 was already
    /// committed to `job.trace` by the earlier delay flush and must
    /// stay there untouched.
    #[test]
    fn fup_bound_by_pgd_clears_buffered_pc_on_match() {
        let map = AddrMap::new();
        map.insert(0x1111, 0x1000);
        map.insert(0x2222, 0x2000);

        let mut bytes = PSB_PATTERN.to_vec();
        // Prime current_ip/mapping with a first TIP.
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000));
        // Second TIP makes the first PC (G1) get logged via the delay.
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x2000));
        // Unbound FUP targeting the same IP as current_ip (0x2000).
        bytes.extend(full_ip_tip(FUP_OPCODE, 0x2000));
        // PGD binds the FUP; ip equals last_tip_ip and current_ip, and
        // the previous IP had a mapping, so the buffered G2 is cleared
        // and re-buffered (not pushed to job.trace) rather than
        // duplicated. G1 remains the only committed entry.
        bytes.extend(full_ip_tip(TIP_PGD_OPCODE, 0x2000));

        let mut state = DecoderState::new();
        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        run_decode_loop(&bytes, &mut state, &mut job, &map, None);
        assert_eq!(job.trace, vec![0x1111]);
        assert_eq!(state.previous_guest_ip, Some(0x2222));
    }

    #[test]
    fn trailing_pc_flushed_at_end_of_job() {
        let map = AddrMap::new();
        map.insert(0x1111, 0x1000);

        let mut bytes = PSB_PATTERN.to_vec();
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000));

        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        decode_job(&bytes, &mut job, &map);
        // Only one TIP ever arrives: the delayed PC is flushed at
        // end-of-job so it is not silently lost.
        assert_eq!(job.trace, vec![0x1111]);
    }

    #[test]
    fn unmapped_ip_produces_no_guest_pc() {
        let map = AddrMap::new();
        let mut bytes = PSB_PATTERN.to_vec();
        bytes.extend(full_ip_tip(TIP_OPCODE, 0xdead));
        bytes.extend(full_ip_tip(TIP_OPCODE, 0xbeef));

        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        decode_job(&bytes, &mut job, &map);
        assert!(job.trace.is_empty());
    }

    #[test]
    fn reserved_ip_bits_011_is_treated_as_unknown_and_skipped() {
        let map = AddrMap::new();
        let mut bytes = PSB_PATTERN.to_vec();
        // opcode with ip_bits = 011, low5 = TIP
        bytes.push(TIP_OPCODE | (0b011 << 5));
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000));
        map.insert(0x1111, 0x1000);

        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        decode_job(&bytes, &mut job, &map);
        // The reserved packet is skipped as a single unknown byte and
        // parsing resumes; the following full-IP TIP still decodes.
        assert_eq!(job.trace, vec![0x1111]);
    }

    /// §4.D packet 1 / §5: a second PSB past `job.end_offset` ends this
    /// job's decode loop right there, so the TIP that follows it is
    /// left for the next job's own resync to pick up — never decoded
    /// twice.
    #[test]
    fn psb_past_job_end_offset_stops_the_job() {
        let map = AddrMap::new();
        map.insert(0x1111, 0x1000);
        map.insert(0x2222, 0x2000);
        map.insert(0x3333, 0x3000);

        let mut bytes = PSB_PATTERN.to_vec(); // 0..16
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x1000)); // 16..25
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x2000)); // 25..34
        bytes.extend(PSB_PATTERN.to_vec()); // 34..50
        bytes.extend(full_ip_tip(TIP_OPCODE, 0x3000)); // 50..59

        let mut job = Job {
            start_offset: 0,
            end_offset: 40, // strictly between the two PSBs
            trace: Vec::new(),
        };
        let mut state = DecoderState::new();
        run_decode_loop(&bytes, &mut state, &mut job, &map, None);

        // Only the first TIP's PC has been flushed by the one-step
        // delay; the second is still buffered, and the TIP beyond the
        // second PSB was never reached.
        assert_eq!(job.trace, vec![0x1111]);
        assert_eq!(state.previous_guest_ip, Some(0x2222));
        assert_eq!(state.current_ip, 0x2000);
    }

    #[test]
    fn no_psb_in_job_produces_empty_trace() {
        let map = AddrMap::new();
        let bytes = vec![0xFFu8; 32];
        let mut job = Job {
            start_offset: 0,
            end_offset: 32,
            trace: Vec::new(),
        };
        decode_job(&bytes, &mut job, &map);
        assert!(job.trace.is_empty());
    }

    #[test]
    fn metrics_distinguish_reserved_ip_bits_from_genuinely_unknown_bytes() {
        let map = AddrMap::new();
        let metrics = Metrics::new();

        let mut bytes = PSB_PATTERN.to_vec();
        bytes.push(TIP_OPCODE | (0b011 << 5)); // reserved ip_bits
        bytes.push(0xFF); // not any recognised opcode/escape

        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        decode_job_with_metrics(&bytes, &mut job, &map, Some(&metrics));

        assert_eq!(metrics.reserved_packets(), 1);
        assert_eq!(metrics.unknown_packets(), 1);
    }

    #[test]
    fn metrics_count_address_map_misses() {
        let map = AddrMap::new();
        let metrics = Metrics::new();

        let mut bytes = PSB_PATTERN.to_vec();
        bytes.extend(full_ip_tip(TIP_OPCODE, 0xdead));
        bytes.extend(full_ip_tip(TIP_OPCODE, 0xbeef));

        let mut job = Job {
            start_offset: 0,
            end_offset: bytes.len() as u64,
            trace: Vec::new(),
        };
        decode_job_with_metrics(&bytes, &mut job, &map, Some(&metrics));

        assert_eq!(metrics.address_map_misses(), 2);
    }
}
