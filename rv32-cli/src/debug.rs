//! A synchronous GDB remote-serial stub: register access, memory access, continue, single-step,
//! and software breakpoints against a [`Simulator`]. Nothing past that minimal set is wired up —
//! no reverse execution, no range-stepping, no hardware watchpoints — the core has no history to
//! rewind through and no watchpoint machinery to drive them with.

use std::collections::HashSet;
use std::fmt;
use std::net::{TcpListener, TcpStream};

use gdbstub::common::Signal;
use gdbstub::conn::ConnectionExt;
use gdbstub::stub::run_blocking::{self, BlockingEventLoop};
use gdbstub::stub::{DisconnectReason, GdbStub, SingleThreadStopReason};
use gdbstub::target::ext::base::singlethread::{
    SingleThreadBase, SingleThreadResume, SingleThreadResumeOps, SingleThreadSingleStep,
    SingleThreadSingleStepOps,
};
use gdbstub::target::ext::breakpoints::{
    Breakpoints, BreakpointsOps, SwBreakpoint, SwBreakpointOps,
};
use gdbstub::target::{Target, TargetError, TargetResult};
use gdbstub_arch::riscv::reg::RiscvCoreRegs;
use gdbstub_arch::riscv::Riscv32;

use rv32_core::hart::Tick;
use rv32_core::registers::Specifier;
use rv32_core::simulator::Simulator;

#[derive(Debug)]
pub enum DebugError {
    Io(std::io::Error),
}

impl fmt::Display for DebugError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DebugError::Io(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for DebugError {}

impl From<std::io::Error> for DebugError {
    fn from(err: std::io::Error) -> Self {
        DebugError::Io(err)
    }
}

/// Drives `simulator` over a single GDB remote-serial connection accepted on `port`. Returns once
/// the debugger disconnects.
pub fn run_debug_server(simulator: Simulator, port: u16) -> Result<(), DebugError> {
    let listener = TcpListener::bind(("127.0.0.1", port))?;
    log::info!("waiting for a GDB connection on 127.0.0.1:{port}");
    let (stream, addr) = listener.accept()?;
    log::info!("GDB connected from {addr}");
    stream.set_nodelay(true)?;
    stream.set_nonblocking(true)?;

    let mut target = DebugTarget::new(simulator);
    let gdb = GdbStub::new(stream);

    match gdb.run_blocking::<DebugEventLoop>(&mut target) {
        Ok(DisconnectReason::Disconnect) => log::info!("GDB disconnected"),
        Ok(reason) => log::info!("GDB session ended: {reason:?}"),
        Err(err) => log::error!("GDB session error: {err}"),
    }
    Ok(())
}

struct DebugTarget {
    simulator: Simulator,
    breakpoints: HashSet<u32>,
}

impl DebugTarget {
    fn new(simulator: Simulator) -> Self {
        Self {
            simulator,
            breakpoints: HashSet::new(),
        }
    }

    fn pc(&self) -> u32 {
        self.simulator.hart().registers().pc()
    }

    fn at_breakpoint(&self) -> bool {
        self.breakpoints.contains(&self.pc())
    }
}

impl Target for DebugTarget {
    type Arch = Riscv32;
    type Error = DebugError;

    fn base_ops(&mut self) -> gdbstub::target::ext::base::BaseOps<'_, Self::Arch, Self::Error> {
        gdbstub::target::ext::base::BaseOps::SingleThread(self)
    }

    fn support_breakpoints(&mut self) -> Option<BreakpointsOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadBase for DebugTarget {
    fn read_registers(&mut self, regs: &mut RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let registers = self.simulator.hart().registers();
        for i in 0..32 {
            regs.x[i] = registers.x(Specifier::from_u5(i as u8));
        }
        regs.pc = registers.pc();
        Ok(())
    }

    fn write_registers(&mut self, regs: &RiscvCoreRegs<u32>) -> TargetResult<(), Self> {
        let registers = self.simulator.hart_mut().registers_mut();
        for i in 0..32 {
            registers.set_x(Specifier::from_u5(i as u8), regs.x[i]);
        }
        *registers.pc_mut() = regs.pc;
        Ok(())
    }

    fn read_addrs(&mut self, start_addr: u32, data: &mut [u8]) -> TargetResult<usize, Self> {
        match self.simulator.hart_mut().debug_read(start_addr, data) {
            Ok(()) => Ok(data.len()),
            Err(_) => Err(TargetError::NonFatal),
        }
    }

    fn write_addrs(&mut self, start_addr: u32, data: &[u8]) -> TargetResult<(), Self> {
        self.simulator
            .hart_mut()
            .debug_write(start_addr, data)
            .map_err(|_| TargetError::NonFatal)
    }

    fn support_resume(&mut self) -> Option<SingleThreadResumeOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadResume for DebugTarget {
    fn resume(&mut self, _signal: Option<Signal>) -> Result<(), Self::Error> {
        Ok(())
    }

    fn support_single_step(&mut self) -> Option<SingleThreadSingleStepOps<'_, Self>> {
        Some(self)
    }
}

impl SingleThreadSingleStep for DebugTarget {
    fn step(&mut self, _signal: Option<Signal>) -> Result<(), Self::Error> {
        self.simulator.tick();
        Ok(())
    }
}

impl Breakpoints for DebugTarget {
    fn support_sw_breakpoint(&mut self) -> Option<SwBreakpointOps<'_, Self>> {
        Some(self)
    }
}

impl SwBreakpoint for DebugTarget {
    fn add_sw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as gdbstub::arch::Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        self.breakpoints.insert(addr);
        Ok(true)
    }

    fn remove_sw_breakpoint(
        &mut self,
        addr: u32,
        _kind: <Self::Arch as gdbstub::arch::Arch>::BreakpointKind,
    ) -> TargetResult<bool, Self> {
        self.breakpoints.remove(&addr);
        Ok(true)
    }
}

enum DebugEventLoop {}

impl BlockingEventLoop for DebugEventLoop {
    type Target = DebugTarget;
    type Connection = TcpStream;
    type StopReason = SingleThreadStopReason<u32>;

    fn wait_for_stop_reason(
        target: &mut DebugTarget,
        conn: &mut TcpStream,
    ) -> Result<
        run_blocking::Event<Self::StopReason>,
        run_blocking::WaitForStopReasonError<
            <Self::Target as Target>::Error,
            <Self::Connection as gdbstub::conn::Connection>::Error,
        >,
    > {
        loop {
            let pending = conn
                .peek()
                .map_err(run_blocking::WaitForStopReasonError::Connection)?;
            if pending.is_some() {
                let byte = conn
                    .read()
                    .map_err(run_blocking::WaitForStopReasonError::Connection)?;
                return Ok(run_blocking::Event::IncomingData(byte));
            }

            if target.simulator.tick() == Tick::Exited {
                return Ok(run_blocking::Event::TargetStopped(
                    SingleThreadStopReason::Exited(0),
                ));
            }
            if target.at_breakpoint() {
                return Ok(run_blocking::Event::TargetStopped(
                    SingleThreadStopReason::SwBreak(()),
                ));
            }
        }
    }

    fn on_interrupt(
        _target: &mut DebugTarget,
    ) -> Result<Option<Self::StopReason>, <Self::Target as Target>::Error> {
        Ok(Some(SingleThreadStopReason::Signal(Signal::SIGINT)))
    }
}
