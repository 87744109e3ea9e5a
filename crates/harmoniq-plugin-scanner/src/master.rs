use std::ffi::OsString;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use crossbeam_channel::{bounded, Sender};
use harmoniq_plugin_db::PluginStore;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::ScannerConfig;
use crate::protocol::{Message, Tag, WorkerPhase};
use crate::scanner::ScanListener;
use crate::transport::{FrameReader, FrameWriter};
use crate::updater::AsyncUpdater;

/// Handle on a running worker, whatever hosts it.
pub trait WorkerProcess: Send {
    /// Forcibly stops the worker. Its channel closes as a consequence.
    fn terminate(&mut self);

    /// Waits for the worker to exit.
    fn reap(&mut self);
}

impl WorkerProcess for Child {
    fn terminate(&mut self) {
        if let Err(err) = self.kill() {
            debug!("failed to kill scan worker {}: {err}", self.id());
        }
    }

    fn reap(&mut self) {
        if let Err(err) = self.wait() {
            debug!("failed to reap scan worker {}: {err}", self.id());
        }
    }
}

/// Both ends of the channel to a freshly started worker.
pub struct WorkerConnection {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub process: Box<dyn WorkerProcess>,
}

pub trait WorkerLauncher: Send + Sync {
    fn launch(&self) -> Result<WorkerConnection>;
}

/// Starts workers as child processes talking over stdin/stdout.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: PathBuf,
    args: Vec<OsString>,
}

impl ProcessLauncher {
    pub fn from_config(config: &ScannerConfig) -> Self {
        Self {
            executable: config.executable.clone(),
            args: config.worker_args(),
        }
    }
}

impl WorkerLauncher for ProcessLauncher {
    fn launch(&self) -> Result<WorkerConnection> {
        let mut child = Command::new(&self.executable)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .with_context(|| format!("failed to spawn {}", self.executable.display()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("scan worker stdout not captured"))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("scan worker stdin not captured"))?;
        debug!("launched scan worker {}", child.id());
        Ok(WorkerConnection {
            reader: Box::new(stdout),
            writer: Box::new(stdin),
            process: Box::new(child),
        })
    }
}

struct Worker {
    writer: FrameWriter<Box<dyn Write + Send>>,
    process: Box<dyn WorkerProcess>,
}

impl Worker {
    /// Lets go of the worker without waiting for it to exit. Closing our
    /// end of the channel first lets a well behaved worker see EOF.
    fn release(self) {
        let Worker { writer, mut process } = self;
        drop(writer);
        let spawned = thread::Builder::new()
            .name("hq-plugin-scan-reaper".into())
            .spawn(move || process.reap());
        if let Err(err) = spawned {
            warn!("failed to spawn scan worker reaper: {err}");
        }
    }
}

struct Session {
    active: bool,
    /// Bumped whenever the current worker is abandoned so that late
    /// messages from it are dropped.
    generation: u64,
    alive: bool,
    phase: WorkerPhase,
    formats: Vec<String>,
    progress: Option<f32>,
    current_file: Option<String>,
    crash_file: Option<String>,
    consecutive_relaunches: u32,
    relaunch_count: u32,
    started_at: Instant,
    last_activity: Instant,
    worker: Option<Worker>,
    listeners: Vec<Arc<dyn ScanListener>>,
}

impl Session {
    fn new() -> Self {
        Self {
            active: false,
            generation: 0,
            alive: false,
            phase: WorkerPhase::Idle,
            formats: Vec::new(),
            progress: None,
            current_file: None,
            crash_file: None,
            consecutive_relaunches: 0,
            relaunch_count: 0,
            started_at: Instant::now(),
            last_activity: Instant::now(),
            worker: None,
            listeners: Vec::new(),
        }
    }

    /// Forgets the current worker and returns it for disposal.
    fn abandon_worker(&mut self) -> Option<Worker> {
        self.generation += 1;
        self.alive = false;
        self.worker.take()
    }
}

enum Reaction {
    SendScan(FrameWriter<Box<dyn Write + Send>>, Vec<String>),
    Relaunch,
    Finish,
}

struct Shared {
    config: ScannerConfig,
    launcher: Box<dyn WorkerLauncher>,
    store: Arc<PluginStore>,
    session: Mutex<Session>,
    updater: AsyncUpdater,
}

/// Supervises scan workers: launches them, follows their progress and
/// relaunches them when a plugin takes one down.
pub struct ScannerMaster {
    shared: Arc<Shared>,
}

impl ScannerMaster {
    pub fn new(
        config: ScannerConfig,
        store: Arc<PluginStore>,
        launcher: Box<dyn WorkerLauncher>,
    ) -> Self {
        let shared = Arc::new_cyclic(|weak: &Weak<Shared>| {
            let weak = weak.clone();
            Shared {
                config,
                launcher,
                store,
                session: Mutex::new(Session::new()),
                updater: AsyncUpdater::new(move || {
                    if let Some(shared) = weak.upgrade() {
                        shared.react();
                    }
                }),
            }
        });
        Self { shared }
    }

    /// Starts a session scanning `formats`. Returns true when a worker is
    /// running afterwards, including when one already was.
    pub fn start_scan(&self, formats: &[String]) -> bool {
        {
            let mut session = self.shared.session.lock();
            if session.active {
                return true;
            }
            session.active = true;
            session.phase = WorkerPhase::Waiting;
            session.formats = formats.to_vec();
            session.progress = None;
            session.current_file = None;
            session.crash_file = None;
            session.consecutive_relaunches = 0;
            session.relaunch_count = 0;
            session.started_at = Instant::now();
        }
        self.shared.updater.cancel_pending();

        if let Err(err) = self.shared.store.save() {
            warn!("failed to save plugin list before scanning: {err}");
        }
        let snapshot = self.shared.config.snapshot();
        if let Err(err) = snapshot.delete() {
            warn!(
                "failed to remove stale scan snapshot {}: {err}",
                snapshot.path().display()
            );
        }

        info!("starting plugin scan of {:?}", formats);
        let launched = self.shared.launch_worker();
        if !launched {
            let mut session = self.shared.session.lock();
            session.active = false;
            session.phase = WorkerPhase::Idle;
        }
        launched
    }

    /// Asks the worker to quit and lets go of it. Does nothing when no
    /// session is active.
    pub fn cancel(&self) {
        let worker = {
            let mut session = self.shared.session.lock();
            if !session.active {
                return;
            }
            session.active = false;
            session.phase = WorkerPhase::Idle;
            session.abandon_worker()
        };
        self.shared.updater.cancel_pending();
        info!("plugin scan cancelled");
        if let Some(worker) = worker {
            let _ = worker.writer.send(&Message::quit());
            worker.release();
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.session.lock().active
    }

    pub fn progress(&self) -> Option<f32> {
        self.shared.session.lock().progress
    }

    pub fn current_file(&self) -> Option<String> {
        self.shared.session.lock().current_file.clone()
    }

    pub fn phase(&self) -> WorkerPhase {
        self.shared.session.lock().phase.clone()
    }

    pub fn relaunch_count(&self) -> u32 {
        self.shared.session.lock().relaunch_count
    }

    pub fn add_listener(&self, listener: Arc<dyn ScanListener>) {
        self.shared.session.lock().listeners.push(listener);
    }

    pub fn remove_listener(&self, listener: &Arc<dyn ScanListener>) {
        self.shared
            .session
            .lock()
            .listeners
            .retain(|existing| !Arc::ptr_eq(existing, listener));
    }
}

impl Drop for ScannerMaster {
    fn drop(&mut self) {
        self.cancel();
    }
}

impl Shared {
    /// Launches a worker and waits for its first message.
    fn launch_worker(self: &Arc<Self>) -> bool {
        let WorkerConnection {
            reader,
            writer,
            process,
        } = match self.launcher.launch() {
            Ok(connection) => connection,
            Err(err) => {
                warn!("failed to launch scan worker: {err:#}");
                return false;
            }
        };

        let generation = {
            let mut session = self.session.lock();
            if let Some(previous) = session.abandon_worker() {
                previous.release();
            }
            session.worker = Some(Worker {
                writer: FrameWriter::new(writer),
                process,
            });
            session.alive = true;
            session.last_activity = Instant::now();
            session.generation
        };

        let (hello_tx, hello_rx) = bounded(1);
        let weak = Arc::downgrade(self);
        let spawned = thread::Builder::new()
            .name("hq-plugin-scan-reader".into())
            .spawn(move || read_worker(weak, generation, reader, hello_tx));
        if let Err(err) = spawned {
            warn!("failed to spawn scan worker reader: {err}");
        }

        match hello_rx.recv_timeout(self.config.launch_timeout) {
            Ok(()) => {
                let weak = Arc::downgrade(self);
                let hang_timeout = self.config.hang_timeout;
                let spawned = thread::Builder::new()
                    .name("hq-plugin-scan-watchdog".into())
                    .spawn(move || watch_for_hangs(weak, generation, hang_timeout));
                if let Err(err) = spawned {
                    warn!("failed to spawn scan worker watchdog: {err}");
                }
                true
            }
            Err(_) => {
                warn!(
                    "scan worker did not connect within {:?}",
                    self.config.launch_timeout
                );
                let worker = {
                    let mut session = self.session.lock();
                    if session.generation == generation {
                        session.abandon_worker()
                    } else {
                        None
                    }
                };
                if let Some(mut worker) = worker {
                    worker.process.terminate();
                    worker.release();
                }
                false
            }
        }
    }

    fn handle_message(&self, generation: u64, message: Message) {
        let mut session = self.session.lock();
        if !session.active || session.generation != generation {
            return;
        }
        session.last_activity = Instant::now();

        match &message.tag {
            Tag::State => {
                let phase = message.phase();
                if phase == session.phase {
                    return;
                }
                debug!("scan worker is now {phase}");
                session.phase = phase;
                drop(session);
                self.updater.trigger();
            }
            Tag::Name => {
                let file = message.payload;
                if session.crash_file.as_deref() != Some(file.as_str()) {
                    session.consecutive_relaunches = 0;
                }
                session.current_file = Some(file.clone());
                let listeners = session.listeners.clone();
                drop(session);
                for listener in &listeners {
                    listener.scan_started(&file);
                }
            }
            Tag::Progress => match message.fraction() {
                Some(fraction) => {
                    session.progress = Some(fraction);
                    let listeners = session.listeners.clone();
                    drop(session);
                    for listener in &listeners {
                        listener.scan_progress(fraction);
                    }
                }
                None => warn!("ignoring malformed progress {:?}", message.payload),
            },
            other => warn!("ignoring unexpected {:?} message from scan worker", other),
        }
    }

    fn handle_connection_lost(&self, generation: u64) {
        let worker = {
            let mut session = self.session.lock();
            if session.generation != generation {
                return;
            }
            session.alive = false;
            session.worker.take()
        };
        // A broken channel does not mean a dead worker: a plugin writing to
        // stdout corrupts the frames while the process keeps running.
        if let Some(mut worker) = worker {
            worker.process.terminate();
            worker.release();
        }
        debug!("lost connection to scan worker");
        self.updater.trigger();
    }

    fn react(self: &Arc<Self>) {
        let reaction = {
            let session = self.session.lock();
            if !session.active {
                return;
            }
            match (&session.phase, session.alive) {
                (WorkerPhase::Finished, _) => Reaction::Finish,
                (WorkerPhase::Ready, true) => match &session.worker {
                    Some(worker) => {
                        Reaction::SendScan(worker.writer.clone(), session.formats.clone())
                    }
                    None => return,
                },
                (WorkerPhase::Waiting | WorkerPhase::Ready | WorkerPhase::Scanning, false) => {
                    Reaction::Relaunch
                }
                (WorkerPhase::Unknown(raw), _) => {
                    warn!("scan worker reported unknown state {raw:?}");
                    return;
                }
                _ => return,
            }
        };

        match reaction {
            Reaction::SendScan(writer, formats) => {
                if let Err(err) = writer.send(&Message::scan(&formats)) {
                    warn!("failed to request scan from worker: {err:#}");
                }
            }
            Reaction::Relaunch => self.relaunch_after_crash(),
            Reaction::Finish => self.finish_session(),
        }
    }

    fn relaunch_after_crash(self: &Arc<Self>) {
        let give_up = {
            let mut session = self.session.lock();
            let crashed_on = session.current_file.clone();
            warn!(
                "scan worker died while {} {}",
                session.phase,
                crashed_on.as_deref().unwrap_or("<no file>")
            );
            let give_up = if session.started_at.elapsed() >= self.config.session_timeout {
                warn!(
                    "plugin scan exceeded {:?}, not relaunching",
                    self.config.session_timeout
                );
                true
            } else if session.consecutive_relaunches >= self.config.max_consecutive_relaunches {
                warn!(
                    "scan worker crashed {} times without progress, giving up",
                    session.consecutive_relaunches + 1
                );
                true
            } else {
                false
            };
            if !give_up {
                session.consecutive_relaunches += 1;
                session.relaunch_count += 1;
                session.crash_file = crashed_on;
                session.phase = WorkerPhase::Waiting;
                session.progress = None;
                session.current_file = None;
            }
            give_up
        };
        if give_up {
            self.finish_session();
            return;
        }

        self.store.reconcile(&self.config.snapshot().load());
        info!("relaunching scan worker");
        if !self.launch_worker() {
            warn!("failed to relaunch scan worker");
            self.finish_session();
        }
    }

    fn finish_session(&self) {
        let (worker, listeners) = {
            // Held across reconciliation: a cancelled session never touches
            // the host registry.
            let mut session = self.session.lock();
            if !session.active {
                return;
            }
            self.store.reconcile(&self.config.snapshot().load());
            let pedal = self.config.pedal();
            if let Err(err) = self.store.with(|registry| pedal.apply(registry)) {
                warn!("failed to apply dead man's pedal: {err}");
            }
            if let Err(err) = self.store.save() {
                warn!(
                    "failed to save plugin list {}: {err}",
                    self.store.path().display()
                );
            }
            session.active = false;
            session.phase = WorkerPhase::Idle;
            (session.abandon_worker(), session.listeners.clone())
        };
        if let Some(worker) = worker {
            let _ = worker.writer.send(&Message::quit());
            worker.release();
        }
        info!("plugin scan finished with {} plugins", self.store.plugins().len());
        for listener in &listeners {
            listener.scan_finished();
        }
    }
}

fn read_worker(
    shared: Weak<Shared>,
    generation: u64,
    reader: Box<dyn Read + Send>,
    hello: Sender<()>,
) {
    let mut reader = FrameReader::new(reader);
    let mut hello = Some(hello);
    loop {
        let message = match reader.recv() {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(err) => {
                warn!("scan worker channel failed: {err:#}");
                break;
            }
        };
        let Some(strong) = shared.upgrade() else {
            return;
        };
        strong.handle_message(generation, message);
        if let Some(hello) = hello.take() {
            let _ = hello.send(());
        }
    }
    // A worker that never spoke is a failed launch, not a crash.
    if hello.is_none() {
        if let Some(strong) = shared.upgrade() {
            strong.handle_connection_lost(generation);
        }
    }
}

/// Kills a worker that stays silent for too long while scanning, which
/// turns a hung probe into an ordinary crash.
fn watch_for_hangs(shared: Weak<Shared>, generation: u64, hang_timeout: Duration) {
    let poll = (hang_timeout / 10).clamp(Duration::from_millis(10), Duration::from_secs(1));
    loop {
        thread::sleep(poll);
        let Some(shared) = shared.upgrade() else {
            return;
        };
        let mut session = shared.session.lock();
        if session.generation != generation || !session.alive {
            return;
        }
        if session.phase == WorkerPhase::Scanning && session.last_activity.elapsed() >= hang_timeout
        {
            warn!(
                "scan worker silent for {:?} on {}, killing it",
                hang_timeout,
                session.current_file.as_deref().unwrap_or("<no file>")
            );
            if let Some(worker) = session.worker.as_mut() {
                worker.process.terminate();
            }
            return;
        }
    }
}
