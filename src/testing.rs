//! Simulated card for unit tests.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use std::boxed::Box;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use std::vec::Vec;

use crate::command::{Command, Reply};
use crate::device::{Completion, Device};
use crate::regs::{HCVR_HC, HostControl, HostStatus, Register, RegisterIo};
use crate::session::{SESSION_WORDS, SharedBuffer};
use crate::{Deadline, Platform, Result};

const INT_DON_VECTOR: u32 = 0x8075;

struct RegisterState {
    control: u32,
    controls: Vec<u32>,
    tx: Vec<u32>,
    rx: VecDeque<u32>,
    vectors: Vec<(u32, Vec<u32>)>,
    ready: bool,
    fifo_limit: usize,
    vector_pending: bool,
    hf3: bool,
    hold_hf3: bool,
    answers_hf2: bool,
}

/// Host interface registers backed by simulated FIFOs.
///
/// Command words written to the transmit register are collected and
/// attributed to the next vector write.  Raising HF0 in the control register
/// drops HF3, unless held.
pub struct MockRegisters {
    inner: Mutex<RegisterState>,
}

impl MockRegisters {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegisterState {
                control: 0,
                controls: Vec::new(),
                tx: Vec::new(),
                rx: VecDeque::new(),
                vectors: Vec::new(),
                ready: true,
                fifo_limit: 16,
                vector_pending: false,
                hf3: false,
                hold_hf3: false,
                answers_hf2: false,
            }),
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.inner.lock().unwrap().ready = ready;
    }

    pub fn set_fifo_limit(&self, limit: usize) {
        self.inner.lock().unwrap().fifo_limit = limit;
    }

    pub fn set_vector_pending(&self, pending: bool) {
        self.inner.lock().unwrap().vector_pending = pending;
    }

    pub fn set_hold_hf3(&self, hold: bool) {
        self.inner.lock().unwrap().hold_hf3 = hold;
    }

    /// Raise HF4 whenever the host raises HF2, as U0107 firmware does.
    pub fn set_answers_hf2(&self, answers: bool) {
        self.inner.lock().unwrap().answers_hf2 = answers;
    }

    /// Queue a message and interrupt.
    pub fn raise(&self, words: &[u32; 4]) {
        let mut inner = self.inner.lock().unwrap();
        inner.rx.extend(words.iter().copied());
        inner.hf3 = true;
    }

    /// Every vector written, with the command words sent before it.
    pub fn vectors(&self) -> Vec<(u32, Vec<u32>)> {
        self.inner.lock().unwrap().vectors.clone()
    }

    pub fn pending_tx(&self) -> Vec<u32> {
        self.inner.lock().unwrap().tx.clone()
    }

    /// Every value written to the control register.
    pub fn controls(&self) -> Vec<u32> {
        self.inner.lock().unwrap().controls.clone()
    }

    pub fn control(&self) -> u32 {
        self.inner.lock().unwrap().control
    }

    /// Commands received by the card, in order.  Quick commands have no
    /// words and are skipped.
    pub fn commands(&self) -> Vec<Command> {
        self.vectors()
            .iter()
            .filter(|(_, words)| words.len() == 4)
            .map(|(_, w)| Command::new(w[0], [w[1], w[2], w[3]]))
            .collect()
    }
}

impl RegisterIo for MockRegisters {
    fn read(&self, reg: Register) -> u32 {
        let mut inner = self.inner.lock().unwrap();
        match reg {
            Register::Status => {
                if inner.hf3 && inner.control & HostControl::HF0.bits() != 0 && !inner.hold_hf3 {
                    inner.hf3 = false;
                }
                let mut status = HostStatus::empty();
                status.set(HostStatus::TRDY, inner.ready && inner.tx.is_empty());
                status.set(HostStatus::HTRQ, inner.tx.len() < inner.fifo_limit);
                status.set(HostStatus::HRRQ, !inner.rx.is_empty());
                status.set(HostStatus::HF3, inner.hf3);
                status.set(HostStatus::HINT, inner.hf3);
                status.set(
                    HostStatus::HF4,
                    inner.answers_hf2 && inner.control & HostControl::HF2.bits() != 0,
                );
                status.bits()
            }
            Register::Control => inner.control,
            Register::Vector => {
                if inner.vector_pending {
                    HCVR_HC
                } else {
                    0
                }
            }
            Register::Receive | Register::Transmit => inner.rx.pop_front().unwrap_or(0),
        }
    }

    fn write(&self, reg: Register, value: u32) {
        let mut inner = self.inner.lock().unwrap();
        match reg {
            Register::Control => {
                inner.control = value;
                inner.controls.push(value);
            }
            Register::Vector => {
                let words = core::mem::take(&mut inner.tx);
                if value & 0x7FFE == INT_DON_VECTOR & 0x7FFE {
                    inner.hf3 = false;
                }
                inner.vectors.push((value, words));
            }
            Register::Transmit | Register::Receive => inner.tx.push(value),
            Register::Status => (),
        }
    }
}

struct BufferState {
    command: [u32; SESSION_WORDS],
    reply: [u32; SESSION_WORDS],
    clears: usize,
}

/// Shared session buffer in plain memory.
pub struct MockBuffer {
    inner: Mutex<BufferState>,
}

pub const COMMAND_BUSADDR: u32 = 0x1234_5000;
pub const REPLY_BUSADDR: u32 = 0x1234_6000;

impl MockBuffer {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(BufferState {
                command: [0; SESSION_WORDS],
                reply: [0; SESSION_WORDS],
                clears: 0,
            }),
        }
    }

    /// Last command written by the host.
    pub fn command(&self) -> [u32; SESSION_WORDS] {
        self.inner.lock().unwrap().command
    }

    /// Place a reply as the card would.
    pub fn set_reply(&self, words: &[u32; SESSION_WORDS]) {
        self.inner.lock().unwrap().reply = *words;
    }

    pub fn clears(&self) -> usize {
        self.inner.lock().unwrap().clears
    }
}

impl SharedBuffer for MockBuffer {
    fn command_busaddr(&self) -> u32 {
        COMMAND_BUSADDR
    }

    fn reply_busaddr(&self) -> u32 {
        REPLY_BUSADDR
    }

    fn write_command(&self, words: &[u32; SESSION_WORDS]) {
        self.inner.lock().unwrap().command = *words;
    }

    fn read_reply(&self, words: &mut [u32; SESSION_WORDS]) {
        *words = self.inner.lock().unwrap().reply;
    }

    fn clear_reply(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.reply = [0; SESSION_WORDS];
        inner.clears += 1;
    }
}

/// Platform with simulated registers and buffer.  Timers are recorded, not
/// run: tests fire them explicitly.
pub struct MockPlatform {
    registers: MockRegisters,
    buffer: MockBuffer,
    armed: Mutex<[Option<u32>; 2]>,
    triggers: AtomicUsize,
    start: Instant,
}

impl MockPlatform {
    pub fn new() -> Self {
        Self {
            registers: MockRegisters::new(),
            buffer: MockBuffer::new(),
            armed: Mutex::new([None; 2]),
            triggers: AtomicUsize::new(0),
            start: Instant::now(),
        }
    }

    /// Token of the armed timer, if any.
    pub fn armed(&self, deadline: Deadline) -> Option<u32> {
        self.armed.lock().unwrap()[Self::slot(deadline)]
    }

    /// Number of times the priority task was triggered.
    pub fn triggers(&self) -> usize {
        self.triggers.load(Ordering::SeqCst)
    }

    fn slot(deadline: Deadline) -> usize {
        match deadline {
            Deadline::Reply => 0,
            Deadline::Session => 1,
        }
    }
}

impl Platform for MockPlatform {
    type Registers = MockRegisters;
    type Buffer = MockBuffer;

    fn registers(&self) -> &MockRegisters {
        &self.registers
    }

    fn buffer(&self) -> &MockBuffer {
        &self.buffer
    }

    fn now_us(&self) -> u64 {
        self.start.elapsed().as_micros() as u64
    }

    fn arm_timer(&self, deadline: Deadline, token: u32, _timeout_us: u32) {
        self.armed.lock().unwrap()[Self::slot(deadline)] = Some(token);
    }

    fn cancel_timer(&self, deadline: Deadline) {
        self.armed.lock().unwrap()[Self::slot(deadline)] = None;
    }

    fn trigger_priority_task(&self) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects completion results.
#[derive(Clone)]
pub struct Recorder {
    results: Arc<Mutex<Vec<Result<Reply>>>>,
}

impl Recorder {
    pub fn results(&self) -> Vec<Result<Reply>> {
        self.results.lock().unwrap().clone()
    }

    pub fn count(&self) -> usize {
        self.results.lock().unwrap().len()
    }
}

pub fn recorder<P: Platform>() -> (Recorder, Completion<P>) {
    let recorder = Recorder {
        results: Arc::new(Mutex::new(Vec::new())),
    };
    let results = recorder.results.clone();
    let completion: Completion<P> = Box::new(move |_: &Device<P>, result: Result<Reply>| {
        results.lock().unwrap().push(result);
    });
    (recorder, completion)
}

pub fn noop<P: Platform>() -> Completion<P> {
    Box::new(|_: &Device<P>, _: Result<Reply>| ())
}

/// Answers commands from a background thread, the way the card would.
///
/// `answer` sees each handshaken command as it is sent and returns the
/// message to raise in response, or `None` to stay silent.
pub struct Responder {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Responder {
    pub fn spawn<T, F>(target: Arc<T>, device: fn(&T) -> &Device<MockPlatform>, answer: F) -> Self
    where
        T: Send + Sync + 'static,
        F: Fn(&Device<MockPlatform>, &Command) -> Option<[u32; 4]> + Send + 'static,
    {
        let stop = Arc::new(AtomicBool::new(false));
        let stopping = stop.clone();
        let handle = thread::spawn(move || {
            let mut seen = 0;
            while !stopping.load(Ordering::SeqCst) {
                let device = device(&target);
                let commands = device.platform().registers().commands();
                for cmd in commands.iter().skip(seen) {
                    if let Some(message) = answer(device, cmd) {
                        device.on_interrupt(&message);
                    }
                }
                seen = commands.len();
                thread::sleep(Duration::from_micros(200));
            }
        });
        Self {
            stop,
            handle: Some(handle),
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// An ACK for every command.
pub fn ack_all(_device: &Device<MockPlatform>, cmd: &Command) -> Option<[u32; 4]> {
    Some([crate::command::REP, cmd.code, crate::command::ACK, 0])
}
