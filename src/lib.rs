//! STM32 Serial Bootloader.
//!
//! Based on AN3155. A [`Programmer`] owns an open serial port and drives the
//! factory bootloader one command at a time: reading the chip ID, erasing
//! flash, reading and writing memory in packet sized chunks, and jumping to
//! user code. Opening and configuring the port (8E1) is left to the caller.

use core::fmt::Debug;

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod error;
pub mod plan;
pub mod progress;
pub mod protocol;
pub mod transport;

pub use error::{ChunkPos, Error, LinkError, Phase, PlanError, Precondition, RangeError, Step};
pub use plan::{EraseSelection, MemorySector, TransferPlan};
pub use progress::{Progress, Stage};
pub use protocol::{Command, EraseVariant, Response, MAX_CHUNK};
pub use transport::{Link, SerialPort};

use plan::Chunk;
use protocol::UART_DISC;

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for an erase to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "300000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub init_delay_ms: u32,

    /// Do not read back and compare memory after loading
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_verify: bool,

    /// Jump to the loaded image once programming completes
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub run: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            response_timeout_ms: 1000,
            erase_timeout_ms: 300_000,
            poll_delay_ms: 1,
            init_delay_ms: 10,
            no_verify: false,
            run: false,
        }
    }
}

/// Progress of the current command exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Resetting,
    Waking,
    AwaitingCommandAck(Command),
    Exchange(Command, Phase),
    AwaitingFinalAck(Command),
    Done,
    Failed(Step),
}

/// Bootloader version and supported command set, as reported by GET
#[derive(Clone, PartialEq, Debug)]
pub struct BootloaderInfo {
    pub version: u8,
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }

    /// Pick an erase encoding the device accepts, preferring the one byte
    /// standard form when the selection fits it
    pub fn erase_variant(&self, selection: &EraseSelection) -> Option<EraseVariant> {
        [EraseVariant::Standard, EraseVariant::Extended]
            .iter()
            .copied()
            .find(|v| self.supports(v.command()) && v.fits(selection))
    }
}

/// Bootloader version and read protection option bytes
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct VersionInfo {
    pub version: u8,
    pub option: [u8; 2],
}

type ProgressFn = Box<dyn FnMut(Progress) + Send>;

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    link: Link<P, D, E>,
    chunk: Option<ChunkPos>,
    progress: Option<ProgressFn>,
    info: Option<BootloaderInfo>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        let link = Link::new(port, delay, options.poll_delay_ms);
        Self {
            state: State::Idle,
            options,
            link,
            chunk: None,
            progress: None,
            info: None,
        }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Install a handler receiving progress of erase and transfer operations
    pub fn set_progress<F>(&mut self, f: F)
    where
        F: FnMut(Progress) + Send + 'static,
    {
        self.progress = Some(Box::new(f));
    }

    /// Release the underlying port and delay provider
    pub fn release(self) -> (P, D) {
        self.link.release()
    }

    /// Connect to the bootloader, optionally resetting the device first
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.info = None;

        // First, reset device
        if !self.options.no_reset {
            debug!("Resetting device");
            self.enter(State::Resetting);

            if let Err(e) = self.link.reset(self.options.init_delay_ms) {
                return Err(self.fail(e));
            }
        }

        // Then, send discovery character
        debug!("Sending discovery character");
        self.enter(State::Waking);
        self.send(&[UART_DISC])?;

        // A device that is already synchronised treats the discovery byte as
        // a bad command and replies with a nack
        debug!("Awaiting bootloader response");
        match self.link.expect_ack(self.options.response_timeout_ms) {
            Ok(Response::Ack) => debug!("Received bootloader ack"),
            Ok(Response::Nack) => warn!("Received nack on discovery, bootloader already active"),
            Err(e) => return Err(self.fail(e)),
        }

        self.enter(State::Done);
        Ok(())
    }

    /// Read the bootloader version and supported commands
    pub fn get(&mut self) -> Result<BootloaderInfo, Error<E>> {
        self.command(Command::Get)?;

        self.enter(State::Exchange(Command::Get, Phase::Response));
        let n = self.recv(1)?[0] as usize;
        let data = self.recv(n + 1)?;

        self.final_ack(Command::Get, self.options.response_timeout_ms)?;

        let info = BootloaderInfo {
            version: data[0],
            commands: data[1..].to_vec(),
        };
        let known: Vec<_> = info.commands.iter().filter_map(|c| Command::from_opcode(*c)).collect();
        debug!("Bootloader version 0x{:02x}, commands {:?}", info.version, known);

        self.info = Some(info.clone());

        Ok(info)
    }

    /// Read the bootloader version and read protection option bytes
    pub fn get_version(&mut self) -> Result<VersionInfo, Error<E>> {
        self.command(Command::GetVersionReadStatus)?;

        self.enter(State::Exchange(Command::GetVersionReadStatus, Phase::Response));
        let data = self.recv(3)?;

        self.final_ack(Command::GetVersionReadStatus, self.options.response_timeout_ms)?;

        Ok(VersionInfo {
            version: data[0],
            option: [data[1], data[2]],
        })
    }

    /// Read the raw product ID
    pub fn get_id(&mut self) -> Result<Vec<u8>, Error<E>> {
        self.command(Command::GetId)?;

        self.enter(State::Exchange(Command::GetId, Phase::Response));
        let n = self.recv(1)?[0] as usize + 1;
        let id = self.recv(n)?;

        self.final_ack(Command::GetId, self.options.response_timeout_ms)?;

        debug!("Chip ID: {:02x?}", id);
        Ok(id)
    }

    /// Jump to the application whose vector table is at `address`.
    ///
    /// The device stops responding once it has acknowledged the address.
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        self.command(Command::Go)?;

        self.enter(State::Exchange(Command::Go, Phase::Address));
        self.send(&protocol::encode_address(address))?;

        self.final_ack(Command::Go, self.options.response_timeout_ms)
    }

    /// Start the application at `address`
    pub fn run(&mut self, address: u32) -> Result<(), Error<E>> {
        info!("Running from 0x{:08x}", address);
        self.go(address)
    }

    /// Erase flash covering `address..address+length`.
    ///
    /// The whole flash is erased when no memory map is given.
    pub fn erase(
        &mut self,
        address: u32,
        length: u32,
        sectors: Option<&[MemorySector]>,
    ) -> Result<(), Error<E>> {
        if sectors.is_some() {
            plan::check_aligned(address)?;
        }

        let selection = plan::plan_erase(address, length, sectors)?;
        match &selection {
            EraseSelection::Mass => info!("Erasing whole flash"),
            EraseSelection::Sectors(s) => info!(
                "Erasing sectors {}..{} for 0x{:08x}+0x{:x}",
                s.start, s.end, address, length
            ),
        }

        self.erase_selection(&selection)
    }

    /// Erase a planned selection, choosing the erase command the device supports.
    ///
    /// The supported commands are fetched with GET on the first erase after
    /// connecting. A failure there is reported against `Get` and happens before
    /// any erase command is sent.
    pub fn erase_selection(&mut self, selection: &EraseSelection) -> Result<(), Error<E>> {
        let info = match &self.info {
            Some(info) => info.clone(),
            None => self.get()?,
        };

        let variant = match info.erase_variant(selection) {
            Some(v) => v,
            None if !info.supports(Command::ExtendedErase) => {
                return Err(Error::Unsupported(Command::ExtendedErase))
            }
            None => EraseVariant::Extended,
        };
        let frame = protocol::encode_erase(selection, variant)?;
        let command = variant.command();
        let units = selection.units();

        self.report(Stage::Erase, 0, units);

        self.command(command)?;

        self.enter(State::Exchange(command, Phase::Sectors));
        self.send(&frame)?;

        self.final_ack(command, self.options.erase_timeout_ms)?;

        self.report(Stage::Erase, units, units);
        Ok(())
    }

    /// Read `length` bytes from `address`
    pub fn read_memory(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Error<E>> {
        let plan = TransferPlan::new(address, length, MAX_CHUNK)?;
        debug!("Reading {} bytes from 0x{:08x} in {} chunks", length, address, plan.len());

        let mut data = Vec::with_capacity(length);
        self.each_chunk(&plan, Stage::Read, |p, chunk| {
            data.extend_from_slice(&p.read_chunk(chunk)?);
            Ok(())
        })?;

        Ok(data)
    }

    /// Read back a memory region
    pub fn dump(&mut self, address: u32, length: usize) -> Result<Vec<u8>, Error<E>> {
        info!("Dumping {} bytes from 0x{:08x}", length, address);
        self.read_memory(address, length)
    }

    /// Read back every sector of a memory map, returning the start address and contents
    pub fn dump_map(&mut self, sectors: &[MemorySector]) -> Result<(u32, Vec<u8>), Error<E>> {
        let (address, length) = plan::map_extent(sectors)?;
        self.dump(address, length).map(|data| (address, data))
    }

    /// Write `data` to `address`, which must be word aligned.
    ///
    /// Chunks are written in ascending order; on failure every chunk before
    /// the one reported in the error has been committed.
    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        plan::check_aligned(address)?;

        let plan = TransferPlan::new(address, data.len(), MAX_CHUNK)?;
        debug!("Writing {} bytes to 0x{:08x} in {} chunks", data.len(), address, plan.len());

        self.each_chunk(&plan, Stage::Write, |p, chunk| {
            p.write_chunk(chunk, &data[chunk.offset..][..chunk.size])
        })
    }

    /// Compare memory at `address` with `expected`
    pub fn verify(&mut self, address: u32, expected: &[u8]) -> Result<(), Error<E>> {
        let plan = TransferPlan::new(address, expected.len(), MAX_CHUNK)?;

        self.each_chunk(&plan, Stage::Verify, |p, chunk| {
            let actual = p.read_chunk(chunk)?;
            let expected = &expected[chunk.offset..][..chunk.size];

            match expected.iter().zip(&actual).position(|(e, a)| e != a) {
                Some(i) => Err(Error::Verify {
                    address: chunk.address + i as u32,
                    expected: expected[i],
                    actual: actual[i],
                }),
                None => Ok(()),
            }
        })
    }

    /// Program a firmware image, erasing the covered flash first if requested
    /// and reading it back unless verification is disabled. With `run` set the
    /// device then jumps to the image.
    pub fn load(
        &mut self,
        address: u32,
        payload: &[u8],
        erase_first: bool,
        sectors: Option<&[MemorySector]>,
    ) -> Result<(), Error<E>> {
        if payload.is_empty() {
            return Err(Precondition::ZeroLength.into());
        }
        plan::check_aligned(address)?;
        plan::check_range(address, payload.len())?;
        let length = plan::erase_length(address, payload.len())?;

        if erase_first {
            self.erase(address, length, sectors)?;
        }

        info!("Loading {} bytes at 0x{:08x}", payload.len(), address);
        self.write_memory(address, payload)?;

        if !self.options.no_verify {
            info!("Validating firmware");
            self.verify(address, payload)?;
        }

        if self.options.run {
            self.run(address)?;
        }

        Ok(())
    }

    fn read_chunk(&mut self, chunk: &Chunk) -> Result<Vec<u8>, Error<E>> {
        let length = protocol::encode_length(chunk.size)?;

        self.command(Command::ReadMemory)?;

        self.enter(State::Exchange(Command::ReadMemory, Phase::Address));
        self.send(&protocol::encode_address(chunk.address))?;
        self.ack(self.options.response_timeout_ms)?;

        self.enter(State::Exchange(Command::ReadMemory, Phase::Length));
        self.send(&length)?;
        self.ack(self.options.response_timeout_ms)?;

        // No checksum protects the returned block
        self.enter(State::Exchange(Command::ReadMemory, Phase::Response));
        let data = self.recv(chunk.size)?;

        self.enter(State::Done);
        Ok(data)
    }

    fn write_chunk(&mut self, chunk: &Chunk, data: &[u8]) -> Result<(), Error<E>> {
        let packet = protocol::encode_data(data)?;

        self.command(Command::WriteMemory)?;

        self.enter(State::Exchange(Command::WriteMemory, Phase::Address));
        self.send(&protocol::encode_address(chunk.address))?;
        self.ack(self.options.response_timeout_ms)?;

        self.enter(State::Exchange(Command::WriteMemory, Phase::Data));
        self.send(&packet)?;

        self.final_ack(Command::WriteMemory, self.options.response_timeout_ms)
    }

    /// Run `f` over each chunk in order, tagging failures with the chunk position
    fn each_chunk<F>(&mut self, plan: &TransferPlan, stage: Stage, mut f: F) -> Result<(), Error<E>>
    where
        F: FnMut(&mut Self, &Chunk) -> Result<(), Error<E>>,
    {
        let total = plan.total();
        self.report(stage, 0, total);

        for (i, chunk) in plan.iter().enumerate() {
            self.chunk = Some(ChunkPos {
                index: i + 1,
                count: plan.len(),
            });
            let r = f(self, chunk);
            self.chunk = None;
            r?;

            self.report(stage, chunk.offset + chunk.size, total);
        }

        Ok(())
    }

    /// Select a command and await its acknowledge
    fn command(&mut self, command: Command) -> Result<(), Error<E>> {
        debug!("Sending command {:?}", command);

        self.enter(State::AwaitingCommandAck(command));
        self.send(&protocol::encode_command(command))?;
        self.ack(self.options.response_timeout_ms)
    }

    fn final_ack(&mut self, command: Command, timeout_ms: u32) -> Result<(), Error<E>> {
        self.enter(State::AwaitingFinalAck(command));
        self.ack(timeout_ms)?;

        self.enter(State::Done);
        Ok(())
    }

    fn send(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        self.link.send(frame).map_err(|e| self.fail(e))
    }

    fn recv(&mut self, n: usize) -> Result<Vec<u8>, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.link.recv_exact(n, timeout).map_err(|e| self.fail(e))
    }

    fn ack(&mut self, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.link.expect_ack(timeout_ms) {
            Ok(Response::Ack) => Ok(()),
            Ok(Response::Nack) => {
                let step = self.step();
                Err(self.abort(Error::Nack(step)))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    fn enter(&mut self, state: State) {
        trace!("{:?} -> {:?}", self.state, state);
        self.state = state;
    }

    /// Step corresponding to the current state
    fn step(&self) -> Step {
        let (command, phase) = match self.state {
            State::Resetting => (None, Phase::Reset),
            State::Idle | State::Waking => (None, Phase::Wake),
            State::AwaitingCommandAck(c) => (Some(c), Phase::Command),
            State::Exchange(c, p) => (Some(c), p),
            State::AwaitingFinalAck(c) => (Some(c), Phase::FinalAck),
            State::Failed(s) => (s.command, s.phase),
            State::Done => (None, Phase::FinalAck),
        };

        Step {
            command,
            phase,
            chunk: self.chunk,
        }
    }

    fn fail(&mut self, e: LinkError<E>) -> Error<E> {
        let step = self.step();
        self.abort(e.at(step))
    }

    fn abort(&mut self, e: Error<E>) -> Error<E> {
        error!("{}", e);
        self.state = State::Failed(self.step());
        e
    }

    fn report(&mut self, stage: Stage, complete: usize, total: usize) {
        if let Some(f) = self.progress.as_mut() {
            f(Progress {
                stage,
                complete,
                total,
            });
        }
    }
}

#[cfg(all(test, feature = "structopt"))]
mod tests {
    use structopt::StructOpt;

    use super::*;

    #[test]
    fn options_parse_with_defaults() {
        let o = Options::from_iter(vec!["dfu", "--no-reset", "--run", "--response-timeout-ms", "250"]);

        assert!(o.no_reset);
        assert!(o.run);
        assert_eq!(o.response_timeout_ms, 250);
        assert_eq!(
            Options {
                no_reset: false,
                run: false,
                response_timeout_ms: 1000,
                ..o
            },
            Options::default()
        );
    }
}
