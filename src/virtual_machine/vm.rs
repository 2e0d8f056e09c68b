//! Guest interpreter.
//!
//! A [`Vm`] owns one complete execution context: the address space, the register file,
//! the descriptor table and the host handles. Nothing is shared between instances, so
//! independent runs may execute on separate threads.
//!
//! Execution is a fetch/decode/dispatch loop over the instruction table in
//! [`isa`](crate::virtual_machine::isa). Every fetch, load and store goes through
//! [`Memory`], which enforces region bounds and permissions, so a guest can only ever
//! end in one of the three [`Outcome`]s.

pub mod context;
pub mod memory;
pub mod registers;
#[cfg(test)]
mod tests;

use crate::virtual_machine::errors::{ExecFault, LoadError};
use crate::virtual_machine::isa::{Instruction, STACK_BASE, STACK_SIZE, STACK_TOP, WORD_SIZE};
use crate::virtual_machine::program::{ProgramImage, SectionKind};
use crate::virtual_machine::syscall::{
    self, FdTable, Interrupt, SYSCALL_ERROR, SyscallContext, SyscallFailure,
};
use crate::{debug, info, warn};
use context::{Deadline, Host, RunLimits};
use memory::{Memory, Perms, Region, RegionKind};
use registers::{Flags, Reg, Registers};
use std::io::Write;
use std::time::{Duration, Instant};

/// The deadline is polled once per this many instructions.
pub const DEADLINE_CHECK_INTERVAL: u64 = 256;

/// Process exit status for an image rejected by the loader.
pub const EXIT_LOAD_REJECTED: i32 = 3;

/// Lifecycle of a [`Vm`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum VmState {
    Loaded,
    Running,
    Halted,
    Faulted(ExecFault),
    TimedOut,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// `hlt` executed.
    Halted,
    Faulted(ExecFault),
    /// Wall-clock budget or instruction cap exhausted.
    TimedOut,
}

impl Outcome {
    /// Process exit status: 0 halted, 1 faulted, 2 timed out.
    pub fn exit_code(&self) -> i32 {
        match self {
            Outcome::Halted => 0,
            Outcome::Faulted(_) => 1,
            Outcome::TimedOut => 2,
        }
    }
}

/// Summary of a finished run.
#[derive(Clone, Debug)]
pub struct RunReport {
    pub outcome: Outcome,
    /// Instructions executed.
    pub steps: u64,
    /// Syscalls that returned `SYSCALL_ERROR`, in order.
    pub syscall_errors: Vec<SyscallFailure>,
    pub elapsed: Duration,
}

impl RunReport {
    pub fn exit_code(&self) -> i32 {
        self.outcome.exit_code()
    }
}

/// Why execution stopped inside a step.
enum Trap {
    Halt,
    Fault(ExecFault),
    Timeout,
}

impl From<ExecFault> for Trap {
    fn from(fault: ExecFault) -> Self {
        Trap::Fault(fault)
    }
}

/// Reads the operands of one instruction out of its fetched bytes.
struct Operands<'a> {
    bytes: &'a [u8],
    pc: u32,
}

impl Operands<'_> {
    fn reg(&mut self) -> Result<Reg, ExecFault> {
        let (&index, rest) = self
            .bytes
            .split_first()
            .ok_or(ExecFault::TruncatedInstruction { pc: self.pc })?;
        self.bytes = rest;
        Reg::new(index).ok_or(ExecFault::InvalidRegister { index, pc: self.pc })
    }

    fn imm(&mut self) -> Result<u32, ExecFault> {
        let (word, rest) = self
            .bytes
            .split_first_chunk::<4>()
            .ok_or(ExecFault::TruncatedInstruction { pc: self.pc })?;
        self.bytes = rest;
        Ok(u32::from_le_bytes(*word))
    }
}

/// Generates the dispatch `match` from a table of `Variant => handler(field: Kind, ...)`.
///
/// Operands are decoded in declaration order; `Mem` operands decode to the register
/// holding the address.
macro_rules! exec_vm {
    (
        vm = $vm:ident,
        operands = $ops:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident ( $( $field:ident : $kind:ident ),* $(,)? ) ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => {
                    $( let $field = exec_vm!(@read $ops, $kind)?; )*
                    $vm.$handler($( $field ),*)
                }
            ),*
        }
    }};

    (@read $ops:ident, Reg) => {{ $ops.reg() }};
    (@read $ops:ident, Mem) => {{ $ops.reg() }};
    (@read $ops:ident, Imm) => {{ $ops.imm() }};
}

/// One guest execution context.
pub struct Vm {
    memory: Memory,
    registers: Registers,
    fds: FdTable,
    host: Host,
    state: VmState,
    steps: u64,
    max_steps: Option<u64>,
    deadline: Deadline,
    /// Address of the instruction after the one executing; branches overwrite it.
    next_pc: u32,
    syscall_errors: Vec<SyscallFailure>,
}

impl Vm {
    /// Lays out the image's sections and a fresh stack.
    ///
    /// Decoded images are already validated; this only fails for images assembled by
    /// hand whose sections collide.
    pub fn load(image: &ProgramImage, host: Host) -> Result<Vm, LoadError> {
        let mut memory = Memory::new();
        for section in &image.sections {
            let (perms, kind) = match section.kind {
                SectionKind::Code => (Perms::READ_EXEC, RegionKind::Text),
                SectionKind::Data => (Perms::READ_WRITE, RegionKind::Data),
            };
            memory
                .insert(Region::new(section.base, section.bytes.clone(), perms, kind))
                .map_err(|other| LoadError::OverlappingSections {
                    name: section.name().to_string(),
                    other: other.name().to_string(),
                })?;
        }
        memory
            .insert(Region::zeroed(
                STACK_BASE,
                STACK_SIZE,
                Perms::READ_WRITE,
                RegionKind::Stack,
            ))
            .map_err(|other| LoadError::OverlappingSections {
                name: "stack".to_string(),
                other: other.name().to_string(),
            })?;
        debug!(
            "loaded image: {} section(s), entry {:#010x}",
            image.sections.len(),
            image.entry
        );
        Ok(Vm {
            memory,
            registers: Registers::new(image.entry),
            fds: FdTable::new(),
            host,
            state: VmState::Loaded,
            steps: 0,
            max_steps: None,
            deadline: Deadline::never(),
            next_pc: image.entry,
            syscall_errors: Vec::new(),
        })
    }

    /// Caps the number of instructions a run may execute.
    pub fn set_step_limit(&mut self, max_steps: Option<u64>) {
        self.max_steps = max_steps;
    }

    pub fn state(&self) -> &VmState {
        &self.state
    }

    pub fn steps(&self) -> u64 {
        self.steps
    }

    pub fn registers(&self) -> &Registers {
        &self.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn syscall_errors(&self) -> &[SyscallFailure] {
        &self.syscall_errors
    }

    /// Runs until the program halts, faults or the deadline passes.
    ///
    /// Once the VM has reached a terminal state, further calls return the same outcome
    /// without executing anything.
    pub fn run(&mut self, deadline: Deadline) -> Outcome {
        match &self.state {
            VmState::Halted => return Outcome::Halted,
            VmState::Faulted(fault) => return Outcome::Faulted(fault.clone()),
            VmState::TimedOut => return Outcome::TimedOut,
            VmState::Loaded | VmState::Running => {}
        }
        self.state = VmState::Running;
        self.deadline = deadline;

        let outcome = loop {
            if self.steps % DEADLINE_CHECK_INTERVAL == 0 && deadline.expired() {
                break Outcome::TimedOut;
            }
            if self.max_steps.is_some_and(|max| self.steps >= max) {
                break Outcome::TimedOut;
            }
            match self.step() {
                Ok(()) => {}
                Err(Trap::Halt) => break Outcome::Halted,
                Err(Trap::Fault(fault)) => break Outcome::Faulted(fault),
                Err(Trap::Timeout) => break Outcome::TimedOut,
            }
        };

        self.finish(&outcome);
        outcome
    }

    /// Records the terminal state and releases host resources.
    fn finish(&mut self, outcome: &Outcome) {
        self.state = match outcome {
            Outcome::Halted => VmState::Halted,
            Outcome::Faulted(fault) => VmState::Faulted(fault.clone()),
            Outcome::TimedOut => VmState::TimedOut,
        };
        self.fds.close_all();
        if let Err(e) = self.host.stdout.flush() {
            debug!("console flush failed: {e}");
        }
        match outcome {
            Outcome::Halted => info!("program halted after {} steps", self.steps),
            Outcome::Faulted(fault) => warn!("program faulted after {} steps: {fault}", self.steps),
            Outcome::TimedOut => warn!("program timed out after {} steps", self.steps),
        }
    }

    /// Fetches, decodes and executes one instruction.
    fn step(&mut self) -> Result<(), Trap> {
        let pc = self.registers.pc;
        let mut opcode = [0u8; 1];
        self.memory.fetch(pc, &mut opcode)?;
        let instr = Instruction::from_opcode(opcode[0]).ok_or(ExecFault::InvalidOpcode {
            opcode: opcode[0],
            pc,
        })?;

        let mut raw = [0u8; Instruction::MAX_SIZE];
        let size = instr.size();
        self.memory
            .fetch(pc, &mut raw[..size])
            .map_err(|_| ExecFault::TruncatedInstruction { pc })?;

        self.steps += 1;
        self.next_pc = pc.wrapping_add(size as u32);
        let mut operands = Operands {
            bytes: &raw[1..size],
            pc,
        };
        self.exec(instr, &mut operands)?;
        self.registers.pc = self.next_pc;
        Ok(())
    }

    fn exec(&mut self, instruction: Instruction, operands: &mut Operands<'_>) -> Result<(), Trap> {
        exec_vm! {
            vm = self,
            operands = operands,
            instr = instruction,
            {
                Hlt => op_hlt(),
                Nop => op_nop(),
                // Data movement
                MovRegImm => op_mov_reg_imm(rd: Reg, imm: Imm),
                MovRegReg => op_mov_reg_reg(rd: Reg, rs: Reg),
                MovRegMem => op_mov_reg_mem(rd: Reg, rs: Mem),
                MovMemReg => op_mov_mem_reg(rd: Mem, rs: Reg),
                MovMemImm => op_mov_mem_imm(rd: Mem, imm: Imm),
                MovbRegMem => op_movb_reg_mem(rd: Reg, rs: Mem),
                MovbMemReg => op_movb_mem_reg(rd: Mem, rs: Reg),
                MovbMemImm => op_movb_mem_imm(rd: Mem, imm: Imm),
                MovbRegImm => op_movb_reg_imm(rd: Reg, imm: Imm),
                // Arithmetic
                AddRegReg => op_add_reg_reg(rd: Reg, rs: Reg),
                AddRegImm => op_add_reg_imm(rd: Reg, imm: Imm),
                SubRegReg => op_sub_reg_reg(rd: Reg, rs: Reg),
                SubRegImm => op_sub_reg_imm(rd: Reg, imm: Imm),
                Inc => op_inc(rd: Reg),
                Dec => op_dec(rd: Reg),
                // Bitwise
                XorRegReg => op_xor_reg_reg(rd: Reg, rs: Reg),
                XorRegImm => op_xor_reg_imm(rd: Reg, imm: Imm),
                XorbRegReg => op_xorb_reg_reg(rd: Reg, rs: Reg),
                XorbRegImm => op_xorb_reg_imm(rd: Reg, imm: Imm),
                AndRegReg => op_and_reg_reg(rd: Reg, rs: Reg),
                AndRegImm => op_and_reg_imm(rd: Reg, imm: Imm),
                OrRegReg => op_or_reg_reg(rd: Reg, rs: Reg),
                OrRegImm => op_or_reg_imm(rd: Reg, imm: Imm),
                // Compare / branch
                CmpRegReg => op_cmp_reg_reg(ra: Reg, rb: Reg),
                CmpRegImm => op_cmp_reg_imm(ra: Reg, imm: Imm),
                Jmp => op_jmp(target: Imm),
                Jz => op_jz(target: Imm),
                Jnz => op_jnz(target: Imm),
                Jl => op_jl(target: Imm),
                Jg => op_jg(target: Imm),
                JmpReg => op_jmp_reg(rs: Reg),
                // Stack / call
                PushReg => op_push_reg(rs: Reg),
                PushImm => op_push_imm(imm: Imm),
                Pop => op_pop(rd: Reg),
                Call => op_call(target: Imm),
                CallReg => op_call_reg(rs: Reg),
                Ret => op_ret(),
                // Host
                Syscall => op_syscall(),
            }
        }
    }

    // ==================== Control ====================

    fn op_hlt(&mut self) -> Result<(), Trap> {
        Err(Trap::Halt)
    }

    fn op_nop(&mut self) -> Result<(), Trap> {
        Ok(())
    }

    // ==================== Data movement ====================

    fn op_mov_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.registers.set(rd, imm);
        Ok(())
    }

    fn op_mov_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.registers.set(rd, self.registers.get(rs));
        Ok(())
    }

    fn op_mov_reg_mem(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        let value = self.memory.load_u32(self.registers.get(rs))?;
        self.registers.set(rd, value);
        Ok(())
    }

    fn op_mov_mem_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.memory
            .store_u32(self.registers.get(rd), self.registers.get(rs))?;
        Ok(())
    }

    fn op_mov_mem_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.memory.store_u32(self.registers.get(rd), imm)?;
        Ok(())
    }

    fn op_movb_reg_mem(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        let byte = self.memory.load_u8(self.registers.get(rs))?;
        self.registers.set(rd, byte as u32);
        Ok(())
    }

    fn op_movb_mem_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.memory
            .store_u8(self.registers.get(rd), self.registers.get(rs) as u8)?;
        Ok(())
    }

    fn op_movb_mem_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.memory.store_u8(self.registers.get(rd), imm as u8)?;
        Ok(())
    }

    fn op_movb_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.registers.set(rd, imm & 0xFF);
        Ok(())
    }

    // ==================== Arithmetic / bitwise ====================

    fn apply(&mut self, rd: Reg, value: u32, f: fn(u32, u32) -> u32) -> Result<(), Trap> {
        self.registers.set(rd, f(self.registers.get(rd), value));
        Ok(())
    }

    fn op_add_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.apply(rd, self.registers.get(rs), u32::wrapping_add)
    }

    fn op_add_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.apply(rd, imm, u32::wrapping_add)
    }

    fn op_sub_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.apply(rd, self.registers.get(rs), u32::wrapping_sub)
    }

    fn op_sub_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.apply(rd, imm, u32::wrapping_sub)
    }

    fn op_inc(&mut self, rd: Reg) -> Result<(), Trap> {
        self.apply(rd, 1, u32::wrapping_add)
    }

    fn op_dec(&mut self, rd: Reg) -> Result<(), Trap> {
        self.apply(rd, 1, u32::wrapping_sub)
    }

    fn op_xor_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.apply(rd, self.registers.get(rs), |a, b| a ^ b)
    }

    fn op_xor_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.apply(rd, imm, |a, b| a ^ b)
    }

    fn op_xorb_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.op_xorb_reg_imm(rd, self.registers.get(rs))
    }

    fn op_xorb_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        let byte = (self.registers.get(rd) ^ imm) as u8;
        self.registers.set_low_byte(rd, byte);
        Ok(())
    }

    fn op_and_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.apply(rd, self.registers.get(rs), |a, b| a & b)
    }

    fn op_and_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.apply(rd, imm, |a, b| a & b)
    }

    fn op_or_reg_reg(&mut self, rd: Reg, rs: Reg) -> Result<(), Trap> {
        self.apply(rd, self.registers.get(rs), |a, b| a | b)
    }

    fn op_or_reg_imm(&mut self, rd: Reg, imm: u32) -> Result<(), Trap> {
        self.apply(rd, imm, |a, b| a | b)
    }

    // ==================== Compare / branch ====================

    fn op_cmp_reg_reg(&mut self, ra: Reg, rb: Reg) -> Result<(), Trap> {
        self.op_cmp_reg_imm(ra, self.registers.get(rb))
    }

    fn op_cmp_reg_imm(&mut self, ra: Reg, imm: u32) -> Result<(), Trap> {
        self.registers.flags = Flags::compare(self.registers.get(ra), imm);
        Ok(())
    }

    fn branch_if(&mut self, taken: bool, target: u32) -> Result<(), Trap> {
        if taken {
            self.next_pc = target;
        }
        Ok(())
    }

    fn op_jmp(&mut self, target: u32) -> Result<(), Trap> {
        self.branch_if(true, target)
    }

    fn op_jz(&mut self, target: u32) -> Result<(), Trap> {
        self.branch_if(self.registers.flags.zero, target)
    }

    fn op_jnz(&mut self, target: u32) -> Result<(), Trap> {
        self.branch_if(!self.registers.flags.zero, target)
    }

    fn op_jl(&mut self, target: u32) -> Result<(), Trap> {
        self.branch_if(self.registers.flags.sign, target)
    }

    fn op_jg(&mut self, target: u32) -> Result<(), Trap> {
        self.branch_if(self.registers.flags.greater(), target)
    }

    fn op_jmp_reg(&mut self, rs: Reg) -> Result<(), Trap> {
        self.branch_if(true, self.registers.get(rs))
    }

    // ==================== Stack / call ====================

    fn push(&mut self, value: u32) -> Result<(), Trap> {
        let sp = self.registers.get(Reg::SP);
        if sp < STACK_BASE + WORD_SIZE {
            return Err(ExecFault::StackOverflow { sp }.into());
        }
        let sp = sp - WORD_SIZE;
        self.memory.store_u32(sp, value)?;
        self.registers.set(Reg::SP, sp);
        Ok(())
    }

    fn pop(&mut self) -> Result<u32, Trap> {
        let sp = self.registers.get(Reg::SP);
        if sp > STACK_TOP - WORD_SIZE {
            return Err(ExecFault::StackUnderflow { sp }.into());
        }
        let value = self.memory.load_u32(sp)?;
        self.registers.set(Reg::SP, sp + WORD_SIZE);
        Ok(value)
    }

    fn op_push_reg(&mut self, rs: Reg) -> Result<(), Trap> {
        self.push(self.registers.get(rs))
    }

    fn op_push_imm(&mut self, imm: u32) -> Result<(), Trap> {
        self.push(imm)
    }

    fn op_pop(&mut self, rd: Reg) -> Result<(), Trap> {
        let value = self.pop()?;
        self.registers.set(rd, value);
        Ok(())
    }

    fn op_call(&mut self, target: u32) -> Result<(), Trap> {
        self.push(self.next_pc)?;
        self.next_pc = target;
        Ok(())
    }

    fn op_call_reg(&mut self, rs: Reg) -> Result<(), Trap> {
        self.op_call(self.registers.get(rs))
    }

    fn op_ret(&mut self) -> Result<(), Trap> {
        self.next_pc = self.pop()?;
        Ok(())
    }

    // ==================== Host ====================

    fn op_syscall(&mut self) -> Result<(), Trap> {
        let number = self.registers.get(Reg::R0);
        let call = syscall::Syscall::try_from(number).map_err(|number| {
            ExecFault::InvalidSyscall {
                number,
                pc: self.registers.pc,
            }
        })?;
        let args = [
            self.registers.get(Reg::R1),
            self.registers.get(Reg::R2),
            self.registers.get(Reg::R5),
            self.registers.get(Reg::R4),
        ];
        let mut ctx = SyscallContext {
            memory: &mut self.memory,
            fds: &mut self.fds,
            host: &mut self.host,
            deadline: self.deadline,
        };
        let result = match ctx.dispatch(call, args) {
            Ok(value) => value,
            Err(Interrupt::Error(error)) => {
                debug!("{call} failed: {error}");
                self.syscall_errors.push(SyscallFailure { call, error });
                SYSCALL_ERROR
            }
            Err(Interrupt::Timeout) => return Err(Trap::Timeout),
        };
        self.registers.set(Reg::R0, result);
        if self.deadline.expired() {
            return Err(Trap::Timeout);
        }
        Ok(())
    }
}

/// Validates, loads and runs an image in one call.
pub fn run_image(bytes: &[u8], host: Host, limits: &RunLimits) -> Result<RunReport, LoadError> {
    run_image_until(bytes, host, Deadline::after(limits.timeout), limits.max_steps)
}

/// Like [`run_image`], against a deadline the caller already started (so host-side
/// readers can share it).
pub fn run_image_until(
    bytes: &[u8],
    host: Host,
    deadline: Deadline,
    max_steps: Option<u64>,
) -> Result<RunReport, LoadError> {
    let started = Instant::now();
    let image = ProgramImage::from_bytes(bytes)?;
    let mut vm = Vm::load(&image, host)?;
    vm.set_step_limit(max_steps);
    let outcome = vm.run(deadline);
    Ok(RunReport {
        outcome,
        steps: vm.steps,
        syscall_errors: std::mem::take(&mut vm.syscall_errors),
        elapsed: started.elapsed(),
    })
}
