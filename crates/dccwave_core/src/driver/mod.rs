//! The runtime that owns the peripherals and feeds compiled bitstreams to
//! the DMA engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam::channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::bitstream::Bitstream;
use crate::driver_log;
use crate::hardware::{
    AllocationError, ClockRegisters, ClockSource, DmaDebug, DmaRegisters, GpioFunction,
    GpioRegisters, Hardware, PwmRegisters, PwmStatus,
};
use crate::scheduler::{DriverTime, EventTag, Scheduler};

pub use queued::{Breakpoint, GpioEvent, ParseError, QueuedBitstream, EVENT_DELAY};

pub mod control_block;
pub mod queued;

/// Polling cadence for the transmission and repetition checks.
const FLAG_POLL_US: u64 = 1_000;
/// Polling cadence for the hardware watchdog.
const WATCHDOG_POLL_US: u64 = 10_000;

/// Bus priorities for the signal's DMA channel.
const DMA_PRIORITY: u8 = 8;
const DMA_PANIC_PRIORITY: u8 = 8;

/// Pin, channel and timing assignment, overridable at startup.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    /// Pin carrying the DCC signal; alternate function 5 routes PWM0 there.
    pub dcc_gpio: usize,
    /// Pin switching the booster off for the RailCom cutout.
    pub railcom_gpio: usize,
    /// Pin raised around packets queued with debug marking.
    pub debug_gpio: usize,
    /// DMA channel dedicated to the signal.
    pub dma_channel: usize,
    /// Requested pulse width in microseconds.
    pub pulse_width: f32,
}

impl Default for DriverOptions {
    fn default() -> Self {
        DriverOptions {
            dcc_gpio: 18,
            railcom_gpio: 17,
            debug_gpio: 19,
            dma_channel: 5,
            pulse_width: 14.5,
        }
    }
}

/// Why a bitstream could not be queued.
#[derive(Debug, thiserror::Error)]
pub enum DriverError {
    /// The bitstream would transmit nothing; append preamble bits and retry.
    #[error("bitstream contains no data; append preamble bits and retry")]
    BitstreamContainsNoData(#[from] ParseError),
    #[error(transparent)]
    AllocationFailed(#[from] AllocationError),
    /// The driver has not been started, or has been shut down.
    #[error("driver is not running")]
    NotRunning,
}

/// A committed bitstream the engine may still be referencing.
struct Transmission {
    id: u64,
    queued: QueuedBitstream,
    completion: Option<Box<dyn FnOnce() + Send>>,
}

struct Shared<H: Hardware> {
    hardware: Arc<H>,
    options: DriverOptions,
    running: AtomicBool,
    queue: Mutex<VecDeque<Transmission>>,
    next_id: AtomicU64,
}

enum WorkerMessage {
    Enqueued(u64),
    Shutdown,
}

/// Generates the signal: initialises the peripherals, admits bitstreams onto
/// a single-producer queue and watches the engine chew through them.
///
/// [`Driver::shutdown`] must run before the process exits; an aborted
/// process leaves the DMA engine looping over the last committed program.
pub struct Driver<H: Hardware> {
    shared: Arc<Shared<H>>,
    sender: Sender<WorkerMessage>,
    receiver: Option<Receiver<WorkerMessage>>,
    worker: Option<JoinHandle<()>>,
}

impl<H: Hardware> Driver<H> {
    pub fn new(hardware: Arc<H>, options: DriverOptions) -> Self {
        let (sender, receiver) = unbounded();

        Driver {
            shared: Arc::new(Shared {
                hardware,
                options,
                running: AtomicBool::new(false),
                queue: Mutex::new(VecDeque::new()),
                next_id: AtomicU64::new(1),
            }),
            sender,
            receiver: Some(receiver),
            worker: None,
        }
    }

    pub fn options(&self) -> &DriverOptions {
        &self.shared.options
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Bitstreams admitted and not yet retired.
    pub fn pending_transmissions(&self) -> usize {
        self.shared.queue.lock().unwrap().len()
    }

    /// Bring the peripherals up and start the polling worker.
    pub fn startup(&mut self) {
        assert!(self.worker.is_none(), "driver already started");

        let hardware = &self.shared.hardware;
        let options = &self.shared.options;

        let pwm = hardware.pwm();
        pwm.disable();
        pwm.clear_status(PwmStatus::errors());
        pwm.clear_fifo();

        let clock = hardware.clock();
        clock.disable();
        while clock.is_running() {
            std::thread::yield_now();
        }
        let divisor = (options.pulse_width * ClockSource::Oscillator.frequency()).round() as u32;
        clock.configure(ClockSource::Oscillator, divisor);
        clock.enable();
        log::debug!(
            "signal clock running at divisor {divisor}, pulse width {:.3}µs",
            divisor as f32 / ClockSource::Oscillator.frequency()
        );

        let dma = hardware.dma_channel(options.dma_channel);
        dma.abort();
        dma.reset();
        dma.clear_error();

        let gpio = hardware.gpio();
        gpio.set_function(options.dcc_gpio, GpioFunction::Alternate5);
        gpio.set_function(options.railcom_gpio, GpioFunction::Output);
        gpio.write_level(options.railcom_gpio, false);
        gpio.set_function(options.debug_gpio, GpioFunction::Output);
        gpio.write_level(options.debug_gpio, false);

        pwm.enable_dma(1, 7);
        pwm.enable_serializer();
        while !pwm.status().contains(PwmStatus::FIFO_FULL) {
            pwm.write_fifo(0);
        }

        self.shared.running.store(true, Ordering::Release);

        let shared = Arc::clone(&self.shared);
        let receiver = self.receiver.take().expect("worker receiver already taken");
        self.worker = Some(std::thread::spawn(move || run_worker(shared, receiver)));

        log::info!("signal driver running on pin {}", options.dcc_gpio);
    }

    /// Compile, commit and queue a bitstream for transmission.
    ///
    /// The completion handler runs once the bitstream has been transmitted
    /// in full at least once. When another bitstream is already playing, the
    /// new one is linked in behind it and takes over at the predecessor's
    /// next breakpoint.
    pub fn enqueue(
        &self,
        bitstream: &Bitstream,
        completion: impl FnOnce() + Send + 'static,
    ) -> Result<(), DriverError> {
        if !self.is_running() {
            return Err(DriverError::NotRunning);
        }

        let hardware = &self.shared.hardware;
        let options = &self.shared.options;

        let mut queued = QueuedBitstream::new(hardware.peripheral_bus_base(), options);
        queued.parse(bitstream)?;

        let mut queue = self.shared.queue.lock().unwrap();

        // Give the predecessor a way into the new program at each of its
        // breakpoints before the addresses are fixed.
        let mut entries = Vec::new();
        if let Some(predecessor) = queue.back() {
            for breakpoint in predecessor.queued.breakpoints().to_vec() {
                let entry = queued.transfer_from(bitstream, &breakpoint)?;
                entries.push((breakpoint.control_block_offset(), entry));
            }
        }

        queued.commit(hardware.as_ref())?;

        if let Some(predecessor) = queue.back() {
            for (offset, entry) in entries {
                predecessor
                    .queued
                    .set_next(offset, queued.control_block_bus_address(entry));
            }
            driver_log!("linked bitstream behind {} breakpoints", predecessor.queued.breakpoints().len());
        } else {
            let dma = hardware.dma_channel(options.dma_channel);
            dma.set_control_block_address(queued.bus_address());
            dma.activate(DMA_PRIORITY, DMA_PANIC_PRIORITY);
            driver_log!("activated engine at {:#010x}", queued.bus_address());
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        queue.push_back(Transmission {
            id,
            queued,
            completion: Some(Box::new(completion)),
        });
        drop(queue);

        // The worker picks the transmission up and starts polling its flag.
        let _ = self.sender.send(WorkerMessage::Enqueued(id));
        Ok(())
    }

    /// Stop the worker, silence the hardware and drop every queued
    /// bitstream.
    pub fn shutdown(&mut self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }

        let _ = self.sender.send(WorkerMessage::Shutdown);
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }

        let hardware = &self.shared.hardware;
        let options = &self.shared.options;

        hardware.pwm().disable();
        hardware.clock().disable();
        hardware.dma_channel(options.dma_channel).abort();

        self.shared.queue.lock().unwrap().clear();

        let gpio = hardware.gpio();
        for pin in [options.dcc_gpio, options.railcom_gpio, options.debug_gpio] {
            gpio.set_function(pin, GpioFunction::Output);
            gpio.write_level(pin, false);
        }

        log::info!("signal driver stopped");
    }
}

impl<H: Hardware> Drop for Driver<H> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// The serial worker: every queue mutation after admission happens here.
fn run_worker<H: Hardware>(shared: Arc<Shared<H>>, receiver: Receiver<WorkerMessage>) {
    let started = Instant::now();
    let mut scheduler = Scheduler::new();
    scheduler.schedule_event(EventTag::Watchdog, DriverTime(WATCHDOG_POLL_US));

    loop {
        scheduler.current_time = DriverTime(started.elapsed().as_micros() as u64);

        let mut completions: Vec<Box<dyn FnOnce() + Send>> = Vec::new();
        while let Some(event) = scheduler.pop_current() {
            match event.tag {
                EventTag::TransmissionCheck(id) => {
                    completions.extend(handle_transmission_check(&shared, &mut scheduler, id));
                }
                EventTag::RepetitionCheck(id) => {
                    if let Some(completion) = handle_repetition_check(&shared, &mut scheduler, id) {
                        completions.push(completion);
                    }
                }
                EventTag::Watchdog => {
                    run_watchdog(&shared);
                    scheduler.schedule_relative(EventTag::Watchdog, DriverTime(WATCHDOG_POLL_US));
                }
            }
        }
        // Completion handlers run outside the queue lock and may do as they
        // please, except touch the queue.
        for completion in completions {
            completion();
        }

        let timeout = match scheduler.next_event_time() {
            Some(when) => Duration::from_micros(when.0.saturating_sub(scheduler.current_time.0)),
            None => Duration::from_micros(WATCHDOG_POLL_US),
        };

        match receiver.recv_timeout(timeout) {
            Ok(WorkerMessage::Enqueued(id)) => {
                scheduler.current_time = DriverTime(started.elapsed().as_micros() as u64);
                scheduler.schedule_relative(EventTag::TransmissionCheck(id), DriverTime(0));
            }
            Ok(WorkerMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
    }
}

/// Wait for the engine to reach a transmission's start block; once it has,
/// every predecessor can be retired and its memory released. Returns the
/// completion handlers of retired predecessors that had already finished a
/// full playback but were not yet polled.
fn handle_transmission_check<H: Hardware>(
    shared: &Arc<Shared<H>>,
    scheduler: &mut Scheduler,
    id: u64,
) -> Vec<Box<dyn FnOnce() + Send>> {
    let mut completions = Vec::new();
    let mut queue = shared.queue.lock().unwrap();
    let position = match queue.iter().position(|entry| entry.id == id) {
        Some(position) => position,
        None => return completions,
    };

    if !queue[position].queued.is_transmitting() {
        scheduler.schedule_relative(EventTag::TransmissionCheck(id), DriverTime(FLAG_POLL_US));
        return completions;
    }

    // Predecessors are no longer referenced by the engine.
    for mut retired in queue.drain(..position) {
        driver_log!("retired transmission {}", retired.id);
        if retired.queued.is_repeating() {
            completions.extend(retired.completion.take());
        }
    }

    let duration = queue.front().map(|entry| entry.queued.duration_us()).unwrap_or(0.0);
    scheduler.schedule_relative(
        EventTag::RepetitionCheck(id),
        DriverTime(duration.ceil() as u64),
    );
    completions
}

/// Wait for the end-of-stream flag; fires the completion handler exactly
/// once.
fn handle_repetition_check<H: Hardware>(
    shared: &Arc<Shared<H>>,
    scheduler: &mut Scheduler,
    id: u64,
) -> Option<Box<dyn FnOnce() + Send>> {
    let mut queue = shared.queue.lock().unwrap();
    let entry = queue.iter_mut().find(|entry| entry.id == id)?;

    if entry.queued.is_repeating() {
        entry.completion.take()
    } else {
        scheduler.schedule_relative(EventTag::RepetitionCheck(id), DriverTime(FLAG_POLL_US));
        None
    }
}

/// Detect and clear hardware error conditions; they are reported, not fatal.
fn run_watchdog<H: Hardware>(shared: &Arc<Shared<H>>) {
    let pwm = shared.hardware.pwm();
    let errors = pwm.status() & PwmStatus::errors();
    if !errors.is_empty() {
        log::warn!("PWM errors detected: {errors:?}");
        pwm.clear_status(errors);
    }

    let dma = shared.hardware.dma_channel(shared.options.dma_channel);
    if dma.status().contains(crate::hardware::DmaStatus::ERROR) {
        let debug = dma.debug_status() & DmaDebug::errors();
        log::warn!("DMA errors detected: {debug:?}");
        dma.clear_debug(debug);
        dma.clear_error();
    }
}
