//! Classic BPF socket filters for libudev-framed datagrams.
//!
//! The program only inspects the fixed header words udevd fills in (see
//! [`crate::device::uevent`]), so datagrams that fail the staged criteria are
//! dropped by the kernel before they are queued on the socket. Kernel-framed
//! datagrams have no such header and always pass.

use crate::device::uevent::{
    string_bloom64, string_hash32, OFFSET_DEVTYPE_HASH, OFFSET_MAGIC, OFFSET_SUBSYSTEM_HASH,
    OFFSET_TAG_BLOOM_HI, OFFSET_TAG_BLOOM_LO, UDEV_MONITOR_MAGIC,
};
use crate::error::ConfigurationError;

use super::filter::FilterCriterion;

/// Instruction budget, matching libudev.
pub const MAX_INSTRUCTIONS: usize = 512;

const BPF_LD: u16 = 0x00;
const BPF_ALU: u16 = 0x04;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_K: u16 = 0x00;
const BPF_AND: u16 = 0x50;
const BPF_JEQ: u16 = 0x10;

const ACCEPT: u32 = 0xffff_ffff;
const DROP: u32 = 0;

/// One BPF instruction, laid out like `struct sock_filter`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instruction {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// A compiled filter program ready to attach with `SO_ATTACH_FILTER`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterProgram {
    instructions: Vec<Instruction>,
}

impl FilterProgram {
    /// Compile the criteria; `None` means "no filter".
    ///
    /// Tags and subsystems are separate groups: a datagram must match at least
    /// one tag (if any are staged) and at least one subsystem (if any are
    /// staged).
    ///
    /// # Errors
    ///
    /// `ConfigurationError::FilterTooLarge` when the program exceeds the
    /// instruction budget or a jump offset overflows.
    pub fn compile(criteria: &[FilterCriterion]) -> Result<Option<Self>, ConfigurationError> {
        if criteria.is_empty() {
            return Ok(None);
        }

        let tags: Vec<&str> = criteria
            .iter()
            .filter_map(|c| match c {
                FilterCriterion::Tag(tag) => Some(tag.as_str()),
                FilterCriterion::Subsystem { .. } => None,
            })
            .collect();
        let subsystems: Vec<(&str, Option<&str>)> = criteria
            .iter()
            .filter_map(|c| match c {
                FilterCriterion::Subsystem { subsystem, devtype } => Some((subsystem.as_str(), devtype.as_deref())),
                FilterCriterion::Tag(_) => None,
            })
            .collect();

        let too_large = |instructions: usize| ConfigurationError::FilterTooLarge {
            instructions,
            max: MAX_INSTRUCTIONS,
        };

        let mut p = Builder::default();

        // Pass anything that is not libudev-framed.
        p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_MAGIC);
        p.jump(BPF_JMP | BPF_JEQ | BPF_K, UDEV_MONITOR_MAGIC, 1, 0);
        p.stmt(BPF_RET | BPF_K, ACCEPT);

        if !tags.is_empty() {
            let mut remaining = tags.len();
            for tag in &tags {
                let bloom = string_bloom64(tag);
                let hi = (bloom >> 32) as u32;
                let lo = (bloom & 0xffff_ffff) as u32;

                p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_TAG_BLOOM_HI);
                p.stmt(BPF_ALU | BPF_AND | BPF_K, hi);
                p.jump(BPF_JMP | BPF_JEQ | BPF_K, hi, 0, 3);
                p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_TAG_BLOOM_LO);
                p.stmt(BPF_ALU | BPF_AND | BPF_K, lo);

                remaining -= 1;
                // Skip the rest of the tag checks and the drop below.
                let skip = u8::try_from(1 + remaining * 6).map_err(|_| too_large(p.len() + remaining * 6 + 1))?;
                p.jump(BPF_JMP | BPF_JEQ | BPF_K, lo, skip, 0);
            }
            p.stmt(BPF_RET | BPF_K, DROP);
        }

        if !subsystems.is_empty() {
            for (subsystem, devtype) in &subsystems {
                p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_SUBSYSTEM_HASH);
                match devtype {
                    None => p.jump(BPF_JMP | BPF_JEQ | BPF_K, string_hash32(subsystem), 0, 1),
                    Some(devtype) => {
                        p.jump(BPF_JMP | BPF_JEQ | BPF_K, string_hash32(subsystem), 0, 3);
                        p.stmt(BPF_LD | BPF_W | BPF_ABS, OFFSET_DEVTYPE_HASH);
                        p.jump(BPF_JMP | BPF_JEQ | BPF_K, string_hash32(devtype), 0, 1);
                    }
                }
                p.stmt(BPF_RET | BPF_K, ACCEPT);
            }
            p.stmt(BPF_RET | BPF_K, DROP);
        }

        p.stmt(BPF_RET | BPF_K, ACCEPT);

        if p.len() > MAX_INSTRUCTIONS {
            return Err(too_large(p.len()));
        }

        Ok(Some(Self {
            instructions: p.instructions,
        }))
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    #[allow(missing_docs)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}

#[derive(Default)]
struct Builder {
    instructions: Vec<Instruction>,
}

impl Builder {
    fn stmt(&mut self, code: u16, k: u32) {
        self.instructions.push(Instruction { code, jt: 0, jf: 0, k });
    }

    fn jump(&mut self, code: u16, k: u32, jt: u8, jf: u8) {
        self.instructions.push(Instruction { code, jt, jf, k });
    }

    fn len(&self) -> usize {
        self.instructions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::UeventBuilder;

    /// Minimal interpreter for the subset of BPF the compiler emits.
    fn run(program: &FilterProgram, packet: &[u8]) -> u32 {
        let ins = program.instructions();
        let mut a: u32 = 0;
        let mut pc = 0usize;
        loop {
            let i = ins[pc];
            match i.code {
                c if c == BPF_LD | BPF_W | BPF_ABS => {
                    let at = i.k as usize;
                    if at + 4 > packet.len() {
                        return 0;
                    }
                    a = u32::from_be_bytes([packet[at], packet[at + 1], packet[at + 2], packet[at + 3]]);
                    pc += 1;
                }
                c if c == BPF_ALU | BPF_AND | BPF_K => {
                    a &= i.k;
                    pc += 1;
                }
                c if c == BPF_JMP | BPF_JEQ | BPF_K => {
                    pc += 1 + usize::from(if a == i.k { i.jt } else { i.jf });
                }
                c if c == BPF_RET | BPF_K => return i.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
        }
    }

    fn subsystem(s: &str, devtype: Option<&str>) -> FilterCriterion {
        FilterCriterion::Subsystem {
            subsystem: s.to_string(),
            devtype: devtype.map(str::to_string),
        }
    }

    #[test]
    fn empty_criteria_compile_to_no_program() {
        assert_eq!(FilterProgram::compile(&[]).unwrap(), None);
    }

    #[test]
    fn subsystem_filter_accepts_only_matching_subsystem() {
        let program = FilterProgram::compile(&[subsystem("net", None)]).unwrap().unwrap();

        let net = UeventBuilder::event("add", "/devices/virtual/net/dummy0", "net").encode_udev();
        let block = UeventBuilder::event("add", "/devices/virtual/block/loop0", "block").encode_udev();

        assert_eq!(run(&program, &net), ACCEPT);
        assert_eq!(run(&program, &block), DROP);
    }

    #[test]
    fn devtype_narrows_subsystem() {
        let program = FilterProgram::compile(&[subsystem("block", Some("disk"))]).unwrap().unwrap();

        let disk = UeventBuilder::event("add", "/devices/x/sda", "block")
            .property("DEVTYPE", "disk")
            .encode_udev();
        let part = UeventBuilder::event("add", "/devices/x/sda/sda1", "block")
            .property("DEVTYPE", "partition")
            .encode_udev();

        assert_eq!(run(&program, &disk), ACCEPT);
        assert_eq!(run(&program, &part), DROP);
    }

    #[test]
    fn tags_and_subsystems_are_both_required() {
        let program = FilterProgram::compile(&[
            FilterCriterion::Tag("seat".to_string()),
            FilterCriterion::Tag("uaccess".to_string()),
            subsystem("input", None),
        ])
        .unwrap()
        .unwrap();

        let tagged_input = UeventBuilder::event("add", "/devices/x/input5", "input")
            .property("TAGS", ":uaccess:")
            .encode_udev();
        let untagged_input = UeventBuilder::event("add", "/devices/x/input6", "input").encode_udev();
        let tagged_sound = UeventBuilder::event("add", "/devices/x/card0", "sound")
            .property("TAGS", ":seat:")
            .encode_udev();

        assert_eq!(run(&program, &tagged_input), ACCEPT);
        assert_eq!(run(&program, &untagged_input), DROP);
        assert_eq!(run(&program, &tagged_sound), DROP);
    }

    #[test]
    fn kernel_framed_datagrams_always_pass() {
        let program = FilterProgram::compile(&[subsystem("net", None)]).unwrap().unwrap();
        let kernel = UeventBuilder::event("add", "/devices/virtual/block/loop0", "block").encode_kernel();
        assert_eq!(run(&program, &kernel), ACCEPT);
    }

    #[test]
    fn oversized_programs_are_rejected() {
        let criteria: Vec<FilterCriterion> = (0..200)
            .map(|i| subsystem(&format!("sub{i}"), Some("t")))
            .collect();
        let err = FilterProgram::compile(&criteria).unwrap_err();
        assert!(matches!(err, ConfigurationError::FilterTooLarge { max: MAX_INSTRUCTIONS, .. }));
    }

    #[test]
    fn too_many_tags_overflow_jump_offsets() {
        let criteria: Vec<FilterCriterion> = (0..50).map(|i| FilterCriterion::Tag(format!("t{i}"))).collect();
        assert!(matches!(
            FilterProgram::compile(&criteria),
            Err(ConfigurationError::FilterTooLarge { .. })
        ));
    }
}
