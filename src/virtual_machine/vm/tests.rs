use super::*;
use crate::virtual_machine::assembler::{AsmOptions, assemble};
use crate::virtual_machine::errors::SyscallError;
use crate::virtual_machine::isa::{MAP_BASE, TEXT_BASE};
use crate::virtual_machine::program::{Section, Symbols};
use crate::virtual_machine::sandbox::SandboxConfig;
use crate::virtual_machine::syscall::Syscall;
use super::context::{ChannelInput, SharedOutput};
use super::memory::Access;
use rand_core::{OsRng, RngCore};
use std::io::Cursor;
use std::net::TcpListener;
use std::time::Duration;

const TEST_STEP_LIMIT: u64 = 1_000_000;

fn image(source: &str) -> ProgramImage {
    assemble(source, &AsmOptions::default()).expect("assembly failed")
}

fn load(source: &str, stdin: &[u8], sandbox: SandboxConfig) -> (Vm, SharedOutput) {
    let out = SharedOutput::new();
    let host = Host::new(Cursor::new(stdin.to_vec()), out.clone(), sandbox);
    let mut vm = Vm::load(&image(source), host).expect("load failed");
    vm.set_step_limit(Some(TEST_STEP_LIMIT));
    (vm, out)
}

/// Runs with no input, no file or network access and a generous deadline.
fn run(source: &str) -> (Vm, Outcome, Vec<u8>) {
    run_with(source, b"", SandboxConfig::deny_all())
}

fn run_with(source: &str, stdin: &[u8], sandbox: SandboxConfig) -> (Vm, Outcome, Vec<u8>) {
    let (mut vm, out) = load(source, stdin, sandbox);
    let outcome = vm.run(Deadline::after(Duration::from_secs(10)));
    (vm, outcome, out.contents())
}

fn reg(vm: &Vm, index: u8) -> u32 {
    vm.registers().get(Reg::new(index).unwrap())
}

fn code_only(bytes: Vec<u8>) -> ProgramImage {
    ProgramImage::new(
        vec![Section {
            kind: SectionKind::Code,
            base: TEXT_BASE,
            bytes,
        }],
        TEXT_BASE,
        Symbols::Release,
    )
}

fn run_image_code(bytes: Vec<u8>) -> Outcome {
    let host = Host::new(io_empty(), SharedOutput::new(), SandboxConfig::deny_all());
    let mut vm = Vm::load(&code_only(bytes), host).unwrap();
    vm.run(Deadline::after(Duration::from_secs(10)))
}

fn io_empty() -> Cursor<Vec<u8>> {
    Cursor::new(Vec::new())
}

// ==================== Console ====================

#[test]
fn prints_marker_and_halts() {
    let (vm, outcome, out) = run(
        "_start:\n\
         mov $r0, #1\n\
         mov $r1, #1\n\
         mov $r2, msg\n\
         mov $r5, #6\n\
         syscall\n\
         hlt\n\
         .data\n\
         msg: .asciz \"XVM-OK\"\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(out, b"XVM-OK");
    assert_eq!(reg(&vm, 0), 6);
    assert_eq!(vm.steps(), 6);
    assert!(vm.syscall_errors().is_empty());
    assert_eq!(vm.state(), &VmState::Halted);
}

#[test]
fn stderr_shares_console_output() {
    let (_, outcome, out) = run(
        "_start:\n\
         mov $r0, #1\n\
         mov $r1, #2\n\
         mov $r2, msg\n\
         mov $r5, #3\n\
         syscall\n\
         hlt\n\
         .data\n\
         msg: .db \"err\"\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(out, b"err");
}

const XOR_PROGRAM: &str = "_start:\n\
     mov $r0, #0\n\
     mov $r1, #0\n\
     mov $r2, buf\n\
     mov $r5, #32\n\
     syscall\n\
     mov $r3, $r0\n\
     mov $r6, buf\n\
     loop:\n\
     cmp $r3, #0\n\
     jz done\n\
     movb $r1, [$r6]\n\
     xorb $r1, #0x5A\n\
     movb [$r6], $r1\n\
     inc $r6\n\
     dec $r3\n\
     jmp loop\n\
     done:\n\
     mov $r0, #1\n\
     mov $r1, #1\n\
     mov $r2, buf\n\
     mov $r5, #32\n\
     syscall\n\
     hlt\n\
     .data\n\
     buf: .zero 32\n";

#[test]
fn xors_random_input() {
    let mut input = [0u8; 32];
    OsRng.fill_bytes(&mut input);
    let (_, outcome, out) = run_with(XOR_PROGRAM, &input, SandboxConfig::deny_all());
    assert_eq!(outcome, Outcome::Halted);
    let expected: Vec<u8> = input.iter().map(|b| b ^ 0x5A).collect();
    assert_eq!(out, expected);
}

#[test]
fn echoes_until_eof() {
    let input = b"the quick brown fox jumps over the lazy dog\n";
    let (vm, outcome, out) = run_with(
        "_start:\n\
         loop:\n\
         mov $r0, #0\n\
         mov $r1, #0\n\
         mov $r2, buf\n\
         mov $r5, #16\n\
         syscall\n\
         cmp $r0, #0\n\
         jz done\n\
         mov $r5, $r0\n\
         mov $r0, #1\n\
         mov $r1, #1\n\
         mov $r2, buf\n\
         syscall\n\
         jmp loop\n\
         done: hlt\n\
         .data\n\
         buf: .zero 16\n",
        input,
        SandboxConfig::deny_all(),
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(out, input);
    assert!(vm.syscall_errors().is_empty());
}

#[test]
fn independent_runs_on_threads() {
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            std::thread::spawn(move || {
                let input = [i; 32];
                let (_, outcome, out) = run_with(XOR_PROGRAM, &input, SandboxConfig::deny_all());
                (outcome, out, i)
            })
        })
        .collect();
    for handle in handles {
        let (outcome, out, i) = handle.join().unwrap();
        assert_eq!(outcome, Outcome::Halted);
        assert_eq!(out, vec![i ^ 0x5A; 32]);
    }
}

// ==================== Arithmetic and control flow ====================

#[test]
fn arithmetic_wraps() {
    let (vm, outcome, _) = run(
        "mov $r1, #0xFFFFFFFF\n\
         inc $r1\n\
         mov $r2, #0\n\
         dec $r2\n\
         mov $r3, #10\n\
         sub $r3, #11\n\
         mov $r4, #0x12345678\n\
         xorb $r4, #0xFF\n\
         mov $r5, #0xF0F0\n\
         and $r5, #0xFF00\n\
         or $r5, #0x1\n\
         movb $r6, #0x1FF\n\
         mov $r7, #3\n\
         add $r7, $r3\n\
         hlt\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 1), 0);
    assert_eq!(reg(&vm, 2), 0xFFFF_FFFF);
    assert_eq!(reg(&vm, 3), 0xFFFF_FFFF);
    assert_eq!(reg(&vm, 4), 0x1234_5687);
    assert_eq!(reg(&vm, 5), 0xF001);
    assert_eq!(reg(&vm, 6), 0xFF);
    assert_eq!(reg(&vm, 7), 2);
}

#[test]
fn signed_branches() {
    let (vm, outcome, _) = run(
        "_start:\n\
         mov $r1, #-5\n\
         cmp $r1, #3\n\
         jl less\n\
         hlt\n\
         less:\n\
         mov $r2, #1\n\
         cmp $r1, #-6\n\
         jg greater\n\
         hlt\n\
         greater:\n\
         mov $r3, #1\n\
         cmp $r1, $r1\n\
         jnz end\n\
         mov $r4, #1\n\
         end: hlt\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 2), 1);
    assert_eq!(reg(&vm, 3), 1);
    assert_eq!(reg(&vm, 4), 1);
}

#[test]
fn call_and_ret_restore_stack() {
    let (vm, outcome, _) = run(
        "double:\n\
         push $bp\n\
         mov $bp, $sp\n\
         add $r1, $r1\n\
         mov $sp, $bp\n\
         pop $bp\n\
         ret\n\
         _start:\n\
         mov $r1, #21\n\
         call double\n\
         mov $r9, double\n\
         call $r9\n\
         hlt\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 1), 84);
    assert_eq!(vm.registers().get(Reg::SP), STACK_TOP);
    assert_eq!(vm.registers().get(Reg::BP), STACK_TOP);
}

#[test]
fn data_words_are_little_endian() {
    let (vm, outcome, _) = run(
        "_start:\n\
         mov $r1, word\n\
         mov $r2, [$r1]\n\
         movb $r3, [$r1]\n\
         mov [$r1], #0xAABBCCDD\n\
         movb $r4, [$r1]\n\
         hlt\n\
         .data\n\
         word: .dw 0x01020304\n",
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 2), 0x0102_0304);
    assert_eq!(reg(&vm, 3), 0x04);
    assert_eq!(reg(&vm, 4), 0xDD);
}

// ==================== Faults ====================

#[test]
fn invalid_opcode_faults() {
    let (vm, outcome, _) = run("_start: nop\n.db 0xEE\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::InvalidOpcode {
            opcode: 0xEE,
            pc: TEXT_BASE + 1
        })
    );
    assert_eq!(outcome.exit_code(), 1);
    assert_eq!(vm.steps(), 1);
}

#[test]
fn running_off_text_faults() {
    let (_, outcome, _) = run("nop\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::MemoryFault {
            addr: TEXT_BASE + 1,
            len: 1,
            access: Access::Execute
        })
    );
}

#[test]
fn data_is_not_executable() {
    let (_, outcome, _) = run("jmp msg\n.data\nmsg: .db 0x01\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::MemoryFault {
            addr: TEXT_BASE + 5,
            len: 1,
            access: Access::Execute
        })
    );
}

#[test]
fn text_is_not_writable() {
    let (_, outcome, _) = run("_start:\nmov $r1, _start\nmov [$r1], #0\nhlt\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::MemoryFault {
            addr: TEXT_BASE,
            len: 4,
            access: Access::Write
        })
    );
}

#[test]
fn unmapped_load_faults() {
    let (_, outcome, _) = run("mov $r1, #0\nmov $r2, [$r1]\nhlt\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::MemoryFault {
            addr: 0,
            len: 4,
            access: Access::Read
        })
    );
}

#[test]
fn stack_underflow() {
    let (_, outcome, _) = run("pop $r1\nhlt\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::StackUnderflow { sp: STACK_TOP })
    );
    let (_, outcome, _) = run("ret\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::StackUnderflow { sp: STACK_TOP })
    );
}

#[test]
fn stack_overflow() {
    let (vm, outcome, _) = run("loop: push #1\njmp loop\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::StackOverflow { sp: STACK_BASE })
    );
    assert_eq!(vm.steps(), 2 * (STACK_SIZE / WORD_SIZE) as u64 + 1);
}

#[test]
fn unassigned_syscall_faults() {
    let (_, outcome, _) = run("mov $r0, #4\nsyscall\nhlt\n");
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::InvalidSyscall {
            number: 4,
            pc: TEXT_BASE + 6
        })
    );
}

#[test]
fn bad_register_byte_faults() {
    assert_eq!(
        run_image_code(vec![0x11, 15, 0, 0x01]),
        Outcome::Faulted(ExecFault::InvalidRegister {
            index: 15,
            pc: TEXT_BASE
        })
    );
}

#[test]
fn truncated_instruction_faults() {
    assert_eq!(
        run_image_code(vec![0x02, 0x10, 0, 1]),
        Outcome::Faulted(ExecFault::TruncatedInstruction { pc: TEXT_BASE + 1 })
    );
}

#[test]
fn terminal_outcome_is_sticky() {
    let (mut vm, outcome, _) = run("nop\nhlt\n");
    assert_eq!(outcome, Outcome::Halted);
    let steps = vm.steps();
    assert_eq!(vm.run(Deadline::after(Duration::from_secs(1))), Outcome::Halted);
    assert_eq!(vm.steps(), steps);

    let (mut vm, outcome, _) = run("pop $r1\n");
    assert!(matches!(outcome, Outcome::Faulted(_)));
    assert_eq!(vm.run(Deadline::never()), outcome);
    assert_eq!(vm.steps(), 1);
}

// ==================== Limits ====================

#[test]
fn infinite_loop_times_out() {
    let bytes = image("_start: jmp _start\n").to_bytes();
    let host = Host::new(io_empty(), SharedOutput::new(), SandboxConfig::deny_all());
    let report = run_image(
        &bytes,
        host,
        &RunLimits::with_timeout(Duration::from_millis(50)),
    )
    .unwrap();
    assert_eq!(report.outcome, Outcome::TimedOut);
    assert_eq!(report.exit_code(), 2);
    assert!(report.elapsed >= Duration::from_millis(50));
    assert!(report.elapsed < Duration::from_secs(5));
    assert!(report.steps > 0);
}

#[test]
fn step_cap_times_out() {
    let bytes = image("_start: jmp _start\n").to_bytes();
    let host = Host::new(io_empty(), SharedOutput::new(), SandboxConfig::deny_all());
    let limits = RunLimits {
        timeout: Duration::from_secs(10),
        max_steps: Some(10),
    };
    let report = run_image(&bytes, host, &limits).unwrap();
    assert_eq!(report.outcome, Outcome::TimedOut);
    assert_eq!(report.steps, 10);
}

#[test]
fn malformed_image_never_runs() {
    let mut bytes = image("mov $r0, #1\nhlt\n").to_bytes();
    bytes[0] = b'X';
    let out = SharedOutput::new();
    let host = Host::new(io_empty(), out.clone(), SandboxConfig::deny_all());
    let err = run_image(&bytes, host, &RunLimits::default()).unwrap_err();
    assert!(matches!(err, LoadError::BadMagic { .. }));
    assert!(out.contents().is_empty());
}

#[test]
fn overlapping_sections_rejected_at_load() {
    let mut image = code_only(vec![0x01, 0x01]);
    image.sections.push(Section {
        kind: SectionKind::Data,
        base: TEXT_BASE + 1,
        bytes: vec![0],
    });
    let host = Host::new(io_empty(), SharedOutput::new(), SandboxConfig::deny_all());
    assert!(matches!(
        Vm::load(&image, host),
        Err(LoadError::OverlappingSections { .. })
    ));
}

// ==================== Files ====================

fn cat_program(path: &str) -> String {
    format!(
        "_start:\n\
         mov $r0, #5\n\
         mov $r1, path\n\
         mov $r2, #0\n\
         syscall\n\
         cmp $r0, #-1\n\
         jz denied\n\
         mov $r8, $r0\n\
         mov $r0, #0\n\
         mov $r1, $r8\n\
         mov $r2, buf\n\
         mov $r5, #64\n\
         syscall\n\
         mov $r5, $r0\n\
         mov $r0, #1\n\
         mov $r1, #1\n\
         mov $r2, buf\n\
         syscall\n\
         mov $r0, #6\n\
         mov $r1, $r8\n\
         syscall\n\
         hlt\n\
         denied:\n\
         mov $r0, #1\n\
         mov $r1, #1\n\
         mov $r2, no\n\
         mov $r5, #6\n\
         syscall\n\
         hlt\n\
         .data\n\
         path: .asciz \"{path}\"\n\
         no: .db \"denied\"\n\
         buf: .zero 64\n"
    )
}

#[test]
fn opens_allowed_file() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("flag.txt");
    std::fs::write(&file, b"FLAG{sandboxed}\n").unwrap();
    let sandbox = SandboxConfig {
        allowed_paths: vec![file.clone()],
        ..SandboxConfig::deny_all()
    };
    let (vm, outcome, out) = run_with(&cat_program(file.to_str().unwrap()), b"", sandbox);
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(out, b"FLAG{sandboxed}\n");
    assert!(vm.syscall_errors().is_empty());
    assert_eq!(reg(&vm, 0), 0, "close succeeded");
}

#[test]
fn denies_file_outside_sandbox() {
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("secret.txt");
    std::fs::write(&file, b"nope").unwrap();
    let (vm, outcome, out) = run_with(
        &cat_program(file.to_str().unwrap()),
        b"",
        SandboxConfig::deny_all(),
    );
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(out, b"denied");
    assert_eq!(vm.syscall_errors().len(), 1);
    assert_eq!(vm.syscall_errors()[0].call, Syscall::Open);
    assert!(matches!(
        vm.syscall_errors()[0].error,
        SyscallError::PathDenied { .. }
    ));
}

// ==================== Memory maps ====================

const MAP_PROGRAM: &str = "_start:\n\
     mov $r0, #2\n\
     mov $r1, #0x100\n\
     mov $r2, #0\n\
     mov $r5, #3\n\
     syscall\n\
     mov $r8, $r0\n\
     mov [$r8], #0xCAFEBABE\n\
     mov $r7, [$r8]\n\
     mov $r0, #3\n\
     mov $r1, $r8\n\
     syscall\n\
     mov $r9, $r0\n\
     mov $r0, #3\n\
     mov $r1, $r8\n\
     syscall\n";

#[test]
fn map_write_unmap() {
    let (vm, outcome, _) = run(&format!("{MAP_PROGRAM}hlt\n"));
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 8), MAP_BASE);
    assert_eq!(reg(&vm, 7), 0xCAFE_BABE);
    assert_eq!(reg(&vm, 9), 0);
    assert_eq!(reg(&vm, 0), SYSCALL_ERROR, "double unmap fails");
    assert_eq!(
        vm.syscall_errors(),
        &[SyscallFailure {
            call: Syscall::Unmap,
            error: SyscallError::NotMapped { addr: MAP_BASE }
        }]
    );
    assert_eq!(vm.memory().mapping_count(), 0);
}

#[test]
fn access_after_unmap_faults() {
    let (_, outcome, _) = run(&format!("{MAP_PROGRAM}mov $r7, [$r8]\nhlt\n"));
    assert_eq!(
        outcome,
        Outcome::Faulted(ExecFault::MemoryFault {
            addr: MAP_BASE,
            len: 4,
            access: Access::Read
        })
    );
}

// ==================== Network ====================

fn loopback_sandbox() -> SandboxConfig {
    let mut sandbox = SandboxConfig::deny_all();
    sandbox.network.enabled = true;
    sandbox.network.allow_loopback = true;
    sandbox
}

fn client_program(port: u16, body: &str) -> String {
    format!(
        "_start:\n\
         mov $r0, #0xC\n\
         mov $r1, #2\n\
         mov $r2, #1\n\
         mov $r5, #0\n\
         syscall\n\
         mov $r8, $r0\n\
         mov $r0, #0xD\n\
         mov $r1, $r8\n\
         mov $r2, host\n\
         mov $r5, #{port}\n\
         syscall\n\
         {body}\
         hlt\n\
         .data\n\
         host: .asciz \"127.0.0.1\"\n\
         ping: .db \"ping\"\n\
         buf: .zero 4\n"
    )
}

#[test]
fn talks_to_loopback_peer() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let peer = std::thread::spawn(move || {
        use std::io::{Read, Write};
        let (mut stream, _) = listener.accept().unwrap();
        let mut buf = [0u8; 4];
        stream.read_exact(&mut buf).unwrap();
        stream.write_all(b"pong").unwrap();
        buf
    });

    let body = "mov $r0, #0xB\n\
                mov $r1, $r8\n\
                mov $r2, ping\n\
                mov $r5, #4\n\
                mov $r4, #0\n\
                syscall\n\
                mov $r0, #0xA\n\
                mov $r1, $r8\n\
                mov $r2, buf\n\
                mov $r5, #4\n\
                mov $r4, #0\n\
                syscall\n\
                mov $r5, $r0\n\
                mov $r0, #1\n\
                mov $r1, #1\n\
                mov $r2, buf\n\
                syscall\n";
    let (vm, outcome, out) = run_with(&client_program(port, body), b"", loopback_sandbox());
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(out, b"pong");
    assert_eq!(&peer.join().unwrap(), b"ping");
    assert!(vm.syscall_errors().is_empty());
    assert_eq!(vm.fds.open_count(), 0, "descriptors released at exit");
}

#[test]
fn network_denied_by_default() {
    let (vm, outcome, _) = run_with(&client_program(80, ""), b"", SandboxConfig::deny_all());
    assert_eq!(outcome, Outcome::Halted);
    assert_eq!(reg(&vm, 0), SYSCALL_ERROR);
    let calls: Vec<Syscall> = vm.syscall_errors().iter().map(|f| f.call).collect();
    assert_eq!(calls, [Syscall::Socket, Syscall::Connect]);
    assert!(matches!(
        vm.syscall_errors()[0].error,
        SyscallError::NetworkDenied { .. }
    ));
}

#[test]
fn blocked_recv_ends_at_deadline() {
    // Never accepted, but the kernel completes the handshake from the backlog.
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let body = "again:\n\
                mov $r0, #0xA\n\
                mov $r1, $r8\n\
                mov $r2, buf\n\
                mov $r5, #4\n\
                mov $r4, #0\n\
                syscall\n\
                jmp again\n";
    let (mut vm, _) = load(&client_program(port, body), b"", loopback_sandbox());
    vm.set_step_limit(None);
    let started = Instant::now();
    let outcome = vm.run(Deadline::after(Duration::from_millis(200)));
    assert_eq!(outcome, Outcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(5));
    drop(listener);
}

/// Console input that stays silent far longer than any run budget here.
struct StalledInput;

impl std::io::Read for StalledInput {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        std::thread::sleep(Duration::from_secs(3));
        Ok(0)
    }
}

#[test]
fn idle_console_read_ends_at_deadline() {
    let deadline = Deadline::after(Duration::from_millis(200));
    let host = Host::new(
        ChannelInput::pump(StalledInput, deadline),
        SharedOutput::new(),
        SandboxConfig::deny_all(),
    );
    let source = "mov $r0, #0\n\
                  mov $r1, #0\n\
                  mov $r2, buf\n\
                  mov $r5, #4\n\
                  syscall\n\
                  hlt\n\
                  .section .data\n\
                  buf: .zero 4\n";
    let mut vm = Vm::load(&image(source), host).unwrap();
    let started = Instant::now();
    assert_eq!(vm.run(deadline), Outcome::TimedOut);
    assert!(started.elapsed() < Duration::from_secs(1));
}
