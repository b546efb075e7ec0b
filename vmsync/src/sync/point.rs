// Canonical sync point: one recorded CPU snapshot, whatever the file version

use super::types::{
    SYNC_DATA_MEMORY_LOGICAL, SYNC_DATA_MEMORY_PHYSICAL, SYNC_TYPE_INTERRUPT, SYNC_TYPE_IRQ_MASK,
    SYNC_TYPE_IS_IRQ, SYNC_TYPE_VMENTER,
};
use std::fmt;

macro_rules! exit_reasons {
    ($($code:literal => $name:ident, $description:literal;)*) => {
        /// VMX basic exit reasons, numbered as the recorder writes them.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ExitReason {
            $($name,)*
            /// A code with no assigned meaning, kept so decoding is lossless.
            Unknown(u8),
        }

        impl ExitReason {
            pub fn from_code(code: u8) -> Self {
                match code {
                    $($code => Self::$name,)*
                    other => Self::Unknown(other),
                }
            }

            pub fn code(self) -> u8 {
                match self {
                    $(Self::$name => $code,)*
                    Self::Unknown(code) => code,
                }
            }

            pub fn description(self) -> &'static str {
                match self {
                    $(Self::$name => $description,)*
                    Self::Unknown(_) => "Unknown",
                }
            }
        }
    };
}

exit_reasons! {
    0 => ExceptionOrNmi, "Exception or non-maskable interrupt (NMI)";
    1 => ExternalInterrupt, "External interrupt";
    2 => TripleFault, "Triple fault";
    3 => InitSignal, "INIT signal";
    4 => Sipi, "Start-up IPI (SIPI)";
    5 => IoSmi, "I/O system-management interrupt (SMI)";
    6 => Smi, "Other SMI";
    7 => InterruptWindow, "Interrupt window exiting";
    8 => NmiWindow, "NMI window exiting";
    9 => TaskSwitch, "Task switch";
    10 => Cpuid, "Guest software attempted to execute CPUID";
    11 => Getsec, "Guest software attempted to execute GETSEC";
    12 => Hlt, "Guest software attempted to execute HLT";
    13 => Invd, "Guest software attempted to execute INVD";
    14 => Invlpg, "Guest software attempted to execute INVLPG";
    15 => Rdpmc, "Guest software attempted to execute RDPMC";
    16 => Rdtsc, "Guest software attempted to execute RDTSC";
    17 => Rsm, "Guest software attempted to execute RSM in SMM";
    18 => Vmcall, "Guest software executed VMCALL";
    19 => Vmclear, "Guest software executed VMCLEAR";
    20 => Vmlaunch, "Guest software executed VMLAUNCH";
    21 => Vmptrld, "Guest software executed VMPTRLD";
    22 => Vmptrst, "Guest software executed VMPTRST";
    23 => Vmread, "Guest software executed VMREAD";
    24 => Vmresume, "Guest software executed VMRESUME";
    25 => Vmwrite, "Guest software executed VMWRITE";
    26 => Vmxoff, "Guest software executed VMXOFF";
    27 => Vmxon, "Guest software executed VMXON";
    28 => MovCrx, "Control-register accesses";
    29 => MovDrx, "Debug-register accesses";
    30 => IoInstruction, "I/O instruction";
    31 => Rdmsr, "RDMSR";
    32 => Wrmsr, "WRMSR";
    33 => InvalidGuestState, "VM-entry failure due to invalid guest state";
    34 => MsrLoad, "VM-entry failure due to MSR loading";
    36 => Mwait, "Guest software executed MWAIT";
    37 => MonitorTrapFlag, "VM exit due to monitor trap flag";
    39 => Monitor, "Guest software attempted to execute MONITOR";
    40 => Pause, "Guest software attempted to execute PAUSE";
    41 => MachineCheck, "VM-entry failure due to machine-check";
    43 => TprBelowThreshold, "TPR below threshold. Guest software executed MOV to CR8";
    44 => ApicAccess, "APIC access";
    46 => XdtrAccess, "Access to GDTR or IDTR";
    47 => TrAccess, "Access to LDTR or TR";
    48 => EptViolation, "EPT violation";
    49 => EptMisconfig, "EPT misconfiguration";
    50 => Invept, "INVEPT";
    51 => Rdtscp, "RDTSCP";
    52 => PreemptTimer, "VMX-preemption timer expired";
    53 => Invvpid, "INVVPID";
    54 => Wbinvd, "WBINVD";
    55 => Xsetbv, "XSETBV";
    57 => Rdrand, "RDRAND";
    58 => Invpcid, "INVPCID";
    59 => Vmfunc, "VMFUNC";
}

impl Default for ExitReason {
    fn default() -> Self {
        Self::ExceptionOrNmi
    }
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown(code) => write!(f, "Unknown ({code})"),
            known => f.write_str(known.description()),
        }
    }
}

/// What a sync point records: leaving the guest, injecting an interrupt, or
/// re-entering the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PointKind {
    #[default]
    VmEnter,
    Interrupt {
        vector: u8,
    },
    VmExit(ExitReason),
}

impl PointKind {
    /// Decode the on-disk 16-bit type field.
    pub fn from_type_field(field: u16) -> Self {
        let low = (field & SYNC_TYPE_IRQ_MASK) as u8;

        if field & SYNC_TYPE_IS_IRQ != 0 {
            return Self::Interrupt { vector: low };
        }

        match low {
            SYNC_TYPE_VMENTER => Self::VmEnter,
            SYNC_TYPE_INTERRUPT => Self::Interrupt { vector: 0 },
            code => Self::VmExit(ExitReason::from_code(code)),
        }
    }

    pub fn to_type_field(self) -> u16 {
        match self {
            Self::VmEnter => SYNC_TYPE_VMENTER as u16,
            Self::Interrupt { vector } => SYNC_TYPE_IS_IRQ | vector as u16,
            Self::VmExit(reason) => reason.code() as u16,
        }
    }

    pub fn is_vmenter(self) -> bool {
        matches!(self, Self::VmEnter)
    }

    pub fn is_interrupt(self) -> bool {
        matches!(self, Self::Interrupt { .. })
    }

    pub fn is_vmexit(self) -> bool {
        matches!(self, Self::VmExit(_))
    }

    pub fn exit_reason(self) -> Option<ExitReason> {
        match self {
            Self::VmExit(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::VmEnter => f.write_str("VMenter"),
            Self::Interrupt { vector } => write!(f, "Interrupt {vector:#04x}"),
            Self::VmExit(reason) => write!(f, "{reason}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataKind {
    MemoryLogical,
    MemoryPhysical,
    Other(u32),
}

impl DataKind {
    /// Map a non-zero block tag. Tag 0 ends a block list and is never a kind.
    pub fn from_tag(tag: u32) -> Self {
        match tag {
            SYNC_DATA_MEMORY_LOGICAL => Self::MemoryLogical,
            SYNC_DATA_MEMORY_PHYSICAL => Self::MemoryPhysical,
            other => Self::Other(other),
        }
    }

    pub fn tag(self) -> u32 {
        match self {
            Self::MemoryLogical => SYNC_DATA_MEMORY_LOGICAL,
            Self::MemoryPhysical => SYNC_DATA_MEMORY_PHYSICAL,
            Self::Other(tag) => tag,
        }
    }
}

/// Memory snapshot attached to a sync point.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataBlock {
    pub kind: DataKind,
    pub offset: u64,
    pub data: Vec<u8>,
}

impl fmt::Display for DataBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            DataKind::MemoryLogical => "LOGICAL",
            DataKind::MemoryPhysical => "PHYSCAL",
            DataKind::Other(_) => "DATAEND",
        };
        write!(f, "{label}:{:x}", self.offset)?;

        for (line, chunk) in self.data.chunks(16).enumerate() {
            write!(f, "\n{:8x}: ", line * 16)?;
            for byte in chunk {
                write!(f, "{byte:02x} ")?;
            }
        }
        Ok(())
    }
}

/// CPU state carried by a sync point, minus rip/rflags/cs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegisterContext {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub cr0: u64,
    pub cr2: u64,
    pub cr3: u64,
    pub cr4: u64,
    pub fpu_sw: u16,
    pub fpu_cw: u16,
    pub fpu_tags: u8,
    /// Always an input from the recorder, never checked.
    pub tsc: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterClass {
    General,
    Control,
    Fpu,
    Timestamp,
}

/// One entry of the register table driving comparisons and dumps.
pub struct RegisterDef {
    pub name: &'static str,
    /// Hex digits used when printing the value.
    pub width: usize,
    pub class: RegisterClass,
    read: fn(&RegisterContext) -> u64,
}

impl RegisterDef {
    pub fn read(&self, context: &RegisterContext) -> u64 {
        (self.read)(context)
    }

    /// General and control registers take part in equivalence checks.
    pub fn is_checked(&self) -> bool {
        matches!(self.class, RegisterClass::General | RegisterClass::Control)
    }
}

impl fmt::Debug for RegisterDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterDef")
            .field("name", &self.name)
            .field("class", &self.class)
            .finish()
    }
}

use RegisterClass::{Control, Fpu, General, Timestamp};

pub static REGISTERS: &[RegisterDef] = &[
    RegisterDef { name: "RAX", width: 16, class: General, read: |c| c.rax },
    RegisterDef { name: "RBX", width: 16, class: General, read: |c| c.rbx },
    RegisterDef { name: "RCX", width: 16, class: General, read: |c| c.rcx },
    RegisterDef { name: "RDX", width: 16, class: General, read: |c| c.rdx },
    RegisterDef { name: "RSI", width: 16, class: General, read: |c| c.rsi },
    RegisterDef { name: "RDI", width: 16, class: General, read: |c| c.rdi },
    RegisterDef { name: "RBP", width: 16, class: General, read: |c| c.rbp },
    RegisterDef { name: "RSP", width: 16, class: General, read: |c| c.rsp },
    RegisterDef { name: "R8", width: 16, class: General, read: |c| c.r8 },
    RegisterDef { name: "R9", width: 16, class: General, read: |c| c.r9 },
    RegisterDef { name: "R10", width: 16, class: General, read: |c| c.r10 },
    RegisterDef { name: "R11", width: 16, class: General, read: |c| c.r11 },
    RegisterDef { name: "R12", width: 16, class: General, read: |c| c.r12 },
    RegisterDef { name: "R13", width: 16, class: General, read: |c| c.r13 },
    RegisterDef { name: "R14", width: 16, class: General, read: |c| c.r14 },
    RegisterDef { name: "R15", width: 16, class: General, read: |c| c.r15 },
    RegisterDef { name: "CR0", width: 16, class: Control, read: |c| c.cr0 },
    RegisterDef { name: "CR2", width: 16, class: Control, read: |c| c.cr2 },
    RegisterDef { name: "CR3", width: 16, class: Control, read: |c| c.cr3 },
    RegisterDef { name: "CR4", width: 16, class: Control, read: |c| c.cr4 },
    RegisterDef { name: "FSW", width: 4, class: Fpu, read: |c| c.fpu_sw as u64 },
    RegisterDef { name: "FCW", width: 4, class: Fpu, read: |c| c.fpu_cw as u64 },
    RegisterDef { name: "FTAGS", width: 2, class: Fpu, read: |c| c.fpu_tags as u64 },
    RegisterDef { name: "TSC", width: 16, class: Timestamp, read: |c| c.tsc },
];

impl RegisterContext {
    /// Same general and control registers; FPU state and TSC are ignored.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.first_checked_change(other).is_none()
    }

    /// Every table entry whose value differs between the two contexts.
    pub fn changed_registers<'a>(
        &'a self,
        other: &'a Self,
    ) -> impl Iterator<Item = &'static RegisterDef> + 'a {
        REGISTERS
            .iter()
            .filter(move |reg| reg.read(self) != reg.read(other))
    }

    pub fn first_checked_change(&self, other: &Self) -> Option<&'static RegisterDef> {
        self.changed_registers(other).find(|reg| reg.is_checked())
    }

    pub(crate) fn fmt_registers(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for reg in REGISTERS {
            write!(f, " {}={:0width$x}", reg.name, reg.read(self), width = reg.width)?;
        }
        Ok(())
    }
}

/// A decoded sync point. The default value is the invalid "no record"
/// sentinel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RawPoint {
    pub context: RegisterContext,
    pub rip: u64,
    pub rflags: u64,
    pub cs: u16,
    pub fault_error_code: u32,
    pub kind: PointKind,
    pub data: Vec<DataBlock>,
}

impl RawPoint {
    /// A zero timestamp marks the end of the stream.
    pub fn is_valid(&self) -> bool {
        self.context.tsc != 0
    }

    pub fn tsc(&self) -> u64 {
        self.context.tsc
    }

    pub fn is_vmenter(&self) -> bool {
        self.kind.is_vmenter()
    }

    pub fn is_interrupt(&self) -> bool {
        self.kind.is_interrupt()
    }

    pub fn is_vmexit(&self) -> bool {
        self.kind.is_vmexit()
    }

    pub fn interrupt_vector(&self) -> u8 {
        match self.kind {
            PointKind::Interrupt { vector } => vector,
            _ => 0,
        }
    }

    /// Same architectural state: registers, rip, rflags and cs. Timestamp,
    /// fault code, FPU state and data are ignored.
    pub fn is_equivalent(&self, other: &Self) -> bool {
        self.context.is_equivalent(&other.context)
            && self.rip == other.rip
            && self.rflags == other.rflags
            && self.cs == other.cs
    }
}

impl fmt::Display for RawPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            PointKind::Interrupt { vector } => {
                format!("Interrupt 0x{vector:02x}-{:08x}", self.fault_error_code)
            }
            kind => kind.to_string(),
        };
        write!(f, "{label:>47} RIP={:016x} RFL={:016x}", self.rip, self.rflags)?;
        self.context.fmt_registers(f)
    }
}

#[cfg(test)]
mod tests {
    #![allow(non_snake_case)]

    use super::*;

    fn point(kind: PointKind) -> RawPoint {
        RawPoint {
            context: RegisterContext {
                rax: 1,
                rbx: 2,
                cr3: 0x1000,
                tsc: 100,
                ..Default::default()
            },
            rip: 0x401000,
            rflags: 0x202,
            cs: 0x10,
            kind,
            ..Default::default()
        }
    }

    #[test]
    fn test_point_kind__irq_flag__then_interrupt_with_vector() {
        assert_eq!(
            PointKind::from_type_field(0x100 | 0x0e),
            PointKind::Interrupt { vector: 0x0e }
        );
        // The flag wins over a low byte that would otherwise mean VMENTER
        assert_eq!(
            PointKind::from_type_field(0x1ff),
            PointKind::Interrupt { vector: 0xff }
        );
    }

    #[test]
    fn test_point_kind__low_byte__then_enter_or_exit_reason() {
        assert_eq!(PointKind::from_type_field(0xff), PointKind::VmEnter);
        assert_eq!(
            PointKind::from_type_field(0xfe),
            PointKind::Interrupt { vector: 0 }
        );
        assert_eq!(
            PointKind::from_type_field(10),
            PointKind::VmExit(ExitReason::Cpuid)
        );
        assert_eq!(
            PointKind::from_type_field(35),
            PointKind::VmExit(ExitReason::Unknown(35))
        );
    }

    #[test]
    fn test_point_kind__type_field__then_reencodes() {
        for kind in [
            PointKind::VmEnter,
            PointKind::Interrupt { vector: 0x20 },
            PointKind::VmExit(ExitReason::Hlt),
            PointKind::VmExit(ExitReason::Unknown(42)),
        ] {
            assert_eq!(PointKind::from_type_field(kind.to_type_field()), kind);
        }
    }

    #[test]
    fn test_exit_reason__codes__then_match_vmx_numbering() {
        assert_eq!(ExitReason::from_code(0), ExitReason::ExceptionOrNmi);
        assert_eq!(ExitReason::from_code(12), ExitReason::Hlt);
        assert_eq!(ExitReason::from_code(30), ExitReason::IoInstruction);
        assert_eq!(ExitReason::from_code(49), ExitReason::EptMisconfig);
        assert_eq!(ExitReason::from_code(59), ExitReason::Vmfunc);
        assert_eq!(ExitReason::Rdtscp.code(), 51);
        assert_eq!(ExitReason::Unknown(200).code(), 200);
        assert_eq!(ExitReason::Rdmsr.description(), "RDMSR");
        assert_eq!(ExitReason::Unknown(56).to_string(), "Unknown (56)");
    }

    #[test]
    fn test_raw_point__zero_tsc__then_invalid() {
        assert!(!RawPoint::default().is_valid());
        assert!(point(PointKind::VmEnter).is_valid());
    }

    #[test]
    fn test_raw_point__equivalent__then_ignores_tsc_fpu_and_data() {
        let a = point(PointKind::Interrupt { vector: 0x20 });
        let mut b = a.clone();
        b.context.tsc = 999;
        b.context.fpu_sw = 0x3800;
        b.fault_error_code = 4;
        b.data.push(DataBlock {
            kind: DataKind::MemoryLogical,
            offset: 0,
            data: vec![1],
        });

        assert!(a.is_equivalent(&b));
        assert_ne!(a, b);
    }

    #[test]
    fn test_raw_point__equivalent__then_checks_rip_and_control_registers() {
        let a = point(PointKind::VmEnter);

        let mut moved = a.clone();
        moved.rip += 2;
        assert!(!a.is_equivalent(&moved));

        let mut remapped = a.clone();
        remapped.context.cr3 = 0x2000;
        assert!(!a.is_equivalent(&remapped));

        let mut widened = a.clone();
        widened.context.r15 = 1;
        assert!(!a.is_equivalent(&widened));
    }

    #[test]
    fn test_raw_point__equality__then_includes_kind() {
        let exit = point(PointKind::VmExit(ExitReason::Cpuid));
        let enter = point(PointKind::VmEnter);
        assert!(exit.is_equivalent(&enter));
        assert_ne!(exit, enter);
    }

    #[test]
    fn test_register_context__changed_registers__then_lists_every_class() {
        let a = point(PointKind::VmEnter).context;
        let mut b = a;
        b.rax = 7;
        b.cr2 = 0xdead;
        b.fpu_tags = 1;
        b.tsc = 200;

        let names: Vec<_> = a.changed_registers(&b).map(|reg| reg.name).collect();
        assert_eq!(names, vec!["RAX", "CR2", "FTAGS", "TSC"]);
        assert_eq!(a.first_checked_change(&b).map(|reg| reg.name), Some("RAX"));
    }

    #[test]
    fn test_data_block__display__then_hex_dump_lines() {
        let block = DataBlock {
            kind: DataKind::MemoryPhysical,
            offset: 0x1000,
            data: (0u8..18).collect(),
        };

        let text = block.to_string();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines[0], "PHYSCAL:1000");
        assert!(lines[1].starts_with("       0: 00 01 02"));
        assert!(lines[2].starts_with("      10: 10 11"));
    }

    #[test]
    fn test_raw_point__display__then_shows_kind_and_registers() {
        let text = point(PointKind::Interrupt { vector: 0x0e }).to_string();
        assert!(text.contains("Interrupt 0x0e-00000000"));
        assert!(text.contains("RIP=0000000000401000"));
        assert!(text.contains("CR3=0000000000001000"));
    }
}
