// Synchronization events: one exit -> [interrupt] -> enter cycle

use super::error::Violation;
use super::point::{DataBlock, ExitReason, RegisterContext, REGISTERS};
use super::types::{FIRST_EXTERNAL_VECTOR, PAGE_FAULT_VECTOR};
use std::fmt;

/// Interrupt delivered between the exit and the enter of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptInfo {
    pub vector: u8,
    /// Where the interrupt fires.
    pub rip: u64,
    pub fault_error_code: u32,
}

/// Whether the registers at VM enter override the known state or must be
/// verified against it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmulationPolicy {
    /// The hypervisor emulated the instruction; trust the new context.
    Override,
    /// The guest is resumed untouched.
    Verify,
    /// Emulation is assumed only if rip moved.
    RipChange,
}

impl EmulationPolicy {
    pub fn for_reason(reason: ExitReason) -> Self {
        match reason {
            ExitReason::IoInstruction
            | ExitReason::Cpuid
            | ExitReason::Rdtsc
            | ExitReason::Rdtscp
            | ExitReason::Rdmsr
            | ExitReason::MovCrx
            | ExitReason::EptMisconfig => Self::Override,
            ExitReason::Hlt => Self::Verify,
            _ => Self::RipChange,
        }
    }
}

/// A reconstructed VM exit -> enter cycle.
///
/// The default value is the invalid event returned once the record stream is
/// exhausted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncEvent {
    /// Ordinal of the record that closed the cycle.
    pub position: u64,
    /// Ordinal of the exit record that opened the cycle (1 when bootstrapped).
    pub start_position: u64,
    pub is_valid: bool,
    pub is_last_event: bool,
    /// The opening exit was never recorded.
    pub is_first_event_context_unknown: bool,
    pub is_instruction_emulation: bool,
    pub start_reason: ExitReason,
    pub start_rip: u64,
    pub start_context: Option<RegisterContext>,
    pub rflags: u64,
    pub new_rip: u64,
    pub new_context: RegisterContext,
    pub interrupt: Option<InterruptInfo>,
    pub data: Vec<DataBlock>,
}

impl SyncEvent {
    /// Event synthesized when the trace starts without its opening exit.
    pub fn bootstrap() -> Self {
        Self {
            start_position: 1,
            is_first_event_context_unknown: true,
            start_reason: ExitReason::ExceptionOrNmi,
            is_instruction_emulation: true,
            ..Default::default()
        }
    }

    pub fn has_interrupt(&self) -> bool {
        self.interrupt.is_some()
    }

    /// Decide override vs verify from the exit reason once the terminal
    /// record is known.
    pub fn apply_emulation_policy(&mut self) {
        match EmulationPolicy::for_reason(self.start_reason) {
            EmulationPolicy::Override => self.is_instruction_emulation = true,
            EmulationPolicy::Verify => {}
            EmulationPolicy::RipChange => {
                if self.start_context.is_some() && self.new_rip != self.start_rip {
                    self.is_instruction_emulation = true;
                }
            }
        }
    }

    /// Reject combinations the replay cannot honour. `strict` additionally
    /// requires non-emulated cycles to leave every checked register alone.
    pub fn check_sanity(&self, strict: bool) -> Result<(), Violation> {
        let Some(start) = self.start_context else {
            return Ok(());
        };

        if let Some(interrupt) = self.interrupt {
            if self.is_instruction_emulation && self.start_rip == interrupt.rip {
                return Err(Violation::EmulationWithImmediateInterrupt);
            }
            if self.new_context.cr2 != start.cr2 && interrupt.vector != PAGE_FAULT_VECTOR {
                return Err(Violation::Cr2ChangeWithoutPageFault {
                    vector: interrupt.vector,
                });
            }
            if interrupt.vector < FIRST_EXTERNAL_VECTOR && self.start_rip != interrupt.rip {
                return Err(Violation::DeferredCpuFault {
                    vector: interrupt.vector,
                });
            }
        }

        if strict && !self.is_instruction_emulation && !self.is_last_event {
            if self.new_rip != self.start_rip {
                return Err(Violation::UnexpectedRegisterChange { register: "RIP" });
            }
            if let Some(reg) = start.first_checked_change(&self.new_context) {
                return Err(Violation::UnexpectedRegisterChange { register: reg.name });
            }
        }

        Ok(())
    }

    /// A cycle that saw no interrupt and left the registers as they were.
    /// The bootstrap cycle never qualifies.
    pub fn is_noop(&self) -> bool {
        self.is_valid
            && !self.is_last_event
            && self.start_position != 1
            && !self.has_interrupt()
            && self
                .start_context
                .is_some_and(|start| start.is_equivalent(&self.new_context))
    }

    /// Merge a no-op cycle with the cycle following it when the recorder
    /// split one synchronization point in two. Returns `None` when `second`
    /// is a cycle of its own.
    pub fn coalesce(first: &SyncEvent, second: SyncEvent) -> Option<SyncEvent> {
        if !first.is_valid || !second.is_valid || first.is_instruction_emulation {
            return None;
        }

        let resumes_first = second
            .start_context
            .is_some_and(|start| first.new_context.is_equivalent(&start));

        if !resumes_first || first.start_rip != second.start_rip {
            return None;
        }

        Some(SyncEvent {
            start_position: first.start_position,
            start_context: first.start_context,
            ..second
        })
    }
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_valid {
            return f.write_str("Invalid event.");
        }

        writeln!(
            f,
            "Sync Event pos ${} - {}",
            self.position,
            self.start_reason.description()
        )?;

        match &self.start_context {
            Some(start) if !self.is_first_event_context_unknown => {
                write!(f, "RIP={:016x} RFL={:016x}", self.start_rip, self.rflags)?;
                start.fmt_registers(f)?;
            }
            _ => f.write_str("First event with unknown VMExit: no input context")?,
        }
        writeln!(f)?;

        if let Some(interrupt) = &self.interrupt {
            write!(f, "Interrupt 0x{:02x}", interrupt.vector)?;
            if self.is_first_event_context_unknown || interrupt.rip != self.start_rip {
                write!(f, " at {:016x}", interrupt.rip)?;
            } else {
                f.write_str(" now")?;
            }
            writeln!(f, " with code {:08x}", interrupt.fault_error_code)?;
        }

        if self.is_last_event {
            return f.write_str("Is last!");
        }

        let label = if self.is_instruction_emulation {
            "emulated"
        } else {
            "to check"
        };
        write!(f, "New context {label} :")?;

        for reg in REGISTERS {
            let value = reg.read(&self.new_context);
            let changed = match &self.start_context {
                Some(start) if !self.is_first_event_context_unknown => reg.read(start) != value,
                _ => true,
            };
            if changed {
                write!(f, " {}={:0width$x}", reg.name, value, width = reg.width)?;
            }
        }
        Ok(())
    }
}
