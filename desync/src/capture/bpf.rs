/// Classic BPF programs for the capture handles
///
/// The kernel runs these before a frame is ever copied to userspace, which
/// keeps the hop estimator cheap on a busy interface. [`run`] interprets the
/// same subset of instructions for the in-memory backend.
use std::net::Ipv4Addr;

// instruction classes
const BPF_LD: u16 = 0x00;
const BPF_LDX: u16 = 0x01;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

// ld/ldx sizes and modes
const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;
const BPF_ABS: u16 = 0x20;
const BPF_IND: u16 = 0x40;
const BPF_MSH: u16 = 0xa0;

// alu/jmp operations, constant operand
const BPF_AND: u16 = 0x50;
const BPF_JA: u16 = 0x00;
const BPF_JEQ: u16 = 0x10;
const BPF_JSET: u16 = 0x40;
const BPF_K: u16 = 0x00;

/// Snapshot length returned by accepting programs
pub const ACCEPT: u32 = 0x0004_0000;

/// One `struct sock_filter`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BpfInstruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

const fn stmt(code: u16, k: u32) -> BpfInstruction {
    BpfInstruction { code, jt: 0, jf: 0, k }
}

const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> BpfInstruction {
    BpfInstruction { code, jt, jf, k }
}

/// IPv4, TCP, unfragmented, SYN and ACK both set
///
/// Equivalent to `ip and tcp and ip[6:2] & 0x1fff = 0 and tcp[13] & 0x12 = 0x12`.
pub fn syn_ack_filter() -> Vec<BpfInstruction> {
    vec![
        /* 0 */ stmt(BPF_LD | BPF_H | BPF_ABS, 12),
        /* 1 */ jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0800, 0, 9),
        /* 2 */ stmt(BPF_LD | BPF_B | BPF_ABS, 23),
        /* 3 */ jump(BPF_JMP | BPF_JEQ | BPF_K, 6, 0, 7),
        /* 4 */ stmt(BPF_LD | BPF_H | BPF_ABS, 20),
        /* 5 */ jump(BPF_JMP | BPF_JSET | BPF_K, 0x1fff, 5, 0),
        /* 6 */ stmt(BPF_LDX | BPF_B | BPF_MSH, 14),
        /* 7 */ stmt(BPF_LD | BPF_B | BPF_IND, 14 + 13),
        /* 8 */ stmt(BPF_ALU | BPF_AND | BPF_K, 0x12),
        /* 9 */ jump(BPF_JMP | BPF_JEQ | BPF_K, 0x12, 0, 1),
        /* 10 */ stmt(BPF_RET | BPF_K, ACCEPT),
        /* 11 */ stmt(BPF_RET | BPF_K, 0),
    ]
}

/// ARP replies whose sender protocol address is `gateway`
pub fn arp_reply_filter(gateway: Ipv4Addr) -> Vec<BpfInstruction> {
    vec![
        /* 0 */ stmt(BPF_LD | BPF_H | BPF_ABS, 12),
        /* 1 */ jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0806, 0, 5),
        /* 2 */ stmt(BPF_LD | BPF_H | BPF_ABS, 20),
        /* 3 */ jump(BPF_JMP | BPF_JEQ | BPF_K, 2, 0, 3),
        /* 4 */ stmt(BPF_LD | BPF_W | BPF_ABS, 28),
        /* 5 */ jump(BPF_JMP | BPF_JEQ | BPF_K, u32::from(gateway), 0, 1),
        /* 6 */ stmt(BPF_RET | BPF_K, ACCEPT),
        /* 7 */ stmt(BPF_RET | BPF_K, 0),
    ]
}

/// Rejects everything; installed while the socket queue is drained
pub fn drop_all_filter() -> Vec<BpfInstruction> {
    vec![stmt(BPF_RET | BPF_K, 0)]
}

fn load(packet: &[u8], offset: usize, size: u16) -> Option<u32> {
    match size {
        BPF_W => packet
            .get(offset..offset.checked_add(4)?)
            .map(|b| u32::from_be_bytes([b[0], b[1], b[2], b[3]])),
        BPF_H => packet
            .get(offset..offset.checked_add(2)?)
            .map(|b| u32::from(u16::from_be_bytes([b[0], b[1]]))),
        BPF_B => packet.get(offset).map(|b| u32::from(*b)),
        _ => None,
    }
}

/// Run `program` over `packet` and return the number of bytes to accept
///
/// Covers the instructions this module emits. Out-of-bounds loads and
/// unknown opcodes reject the packet, as the kernel does.
pub fn run(program: &[BpfInstruction], packet: &[u8]) -> u32 {
    let mut a: u32 = 0;
    let mut x: u32 = 0;
    let mut pc = 0usize;

    while let Some(ins) = program.get(pc) {
        pc += 1;
        let class = ins.code & 0x07;
        let size = ins.code & 0x18;
        let mode = ins.code & 0xe0;
        let op = ins.code & 0xf0;

        match class {
            BPF_LD => {
                let offset = match mode {
                    BPF_ABS => ins.k as usize,
                    BPF_IND => (x as usize).saturating_add(ins.k as usize),
                    _ => return 0,
                };
                match load(packet, offset, size) {
                    Some(value) => a = value,
                    None => return 0,
                }
            }
            BPF_LDX if mode == BPF_MSH && size == BPF_B => match packet.get(ins.k as usize) {
                Some(byte) => x = u32::from(byte & 0x0f) * 4,
                None => return 0,
            },
            BPF_ALU if op == BPF_AND => a &= ins.k,
            BPF_JMP => {
                let taken = match op {
                    BPF_JA => {
                        pc += ins.k as usize;
                        continue;
                    }
                    BPF_JEQ => a == ins.k,
                    BPF_JSET => a & ins.k != 0,
                    _ => return 0,
                };
                pc += usize::from(if taken { ins.jt } else { ins.jf });
            }
            BPF_RET => return ins.k,
            _ => return 0,
        }
    }

    0
}
