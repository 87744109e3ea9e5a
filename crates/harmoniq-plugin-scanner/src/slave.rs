use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::unbounded;
use harmoniq_plugin_db::{
    DeadMansPedal, FormatHandler, FormatManager, MergePolicy, PluginId, PluginRegistry,
    SnapshotFile,
};
use tracing::{debug, info, warn};

use crate::config::{ScannerConfig, WorkerArgs};
use crate::protocol::{Message, Tag, WorkerPhase};
use crate::transport::{FrameReader, FrameWriter};

enum SlaveCommand {
    Scan(Vec<String>),
    Quit,
}

/// Worker side of a scan. Owns its own copy of the registry and shares
/// results with the supervisor only through the snapshot file.
pub struct ScannerSlave {
    config: ScannerConfig,
    formats: FormatManager,
    snapshot: SnapshotFile,
    pedal: DeadMansPedal,
    list: PluginRegistry,
}

impl ScannerSlave {
    pub fn new(config: ScannerConfig, formats: FormatManager) -> Self {
        let snapshot = config.snapshot();
        let pedal = config.pedal();
        Self {
            config,
            formats,
            snapshot,
            pedal,
            list: PluginRegistry::new(),
        }
    }

    pub fn known_plugins(&self) -> &PluginRegistry {
        &self.list
    }

    /// Serves one supervisor until it asks us to quit or goes away.
    pub fn run<R, W>(mut self, reader: R, writer: W) -> Result<()>
    where
        R: Read + Send + 'static,
        W: Write,
    {
        let writer = FrameWriter::new(writer);
        send_state(&writer, WorkerPhase::Waiting)?;
        self.connection_made();
        send_state(&writer, WorkerPhase::Ready)?;

        let quit = Arc::new(AtomicBool::new(false));
        let (command_tx, command_rx) = unbounded();
        let reader_quit = Arc::clone(&quit);
        thread::spawn(move || {
            let mut reader = FrameReader::new(reader);
            loop {
                match reader.recv() {
                    Ok(Some(message)) => match message.tag {
                        Tag::Scan => {
                            if command_tx.send(SlaveCommand::Scan(message.formats())).is_err() {
                                break;
                            }
                        }
                        Tag::Quit => break,
                        other => warn!("ignoring unexpected {:?} message from master", other),
                    },
                    Ok(None) => break,
                    Err(err) => {
                        warn!("lost connection to master: {err:#}");
                        break;
                    }
                }
            }
            reader_quit.store(true, Ordering::SeqCst);
            let _ = command_tx.send(SlaveCommand::Quit);
        });

        for command in command_rx.iter() {
            match command {
                SlaveCommand::Scan(formats) => self.scan(&formats, &writer, &quit)?,
                SlaveCommand::Quit => break,
            }
        }

        info!("plugin scanner worker quitting");
        let _ = send_state(&writer, WorkerPhase::Quitting);
        Ok(())
    }

    fn connection_made(&mut self) {
        if !self.snapshot.exists() {
            self.persist();
        }
        self.list = self.snapshot.load();

        // Crash evidence must land in the snapshot before the pedal goes away.
        match self.pedal.read() {
            Ok(files) if !files.is_empty() => {
                for file in files {
                    warn!("{file} crashed a previous scan, blacklisting it");
                    self.list.add_to_blacklist(file);
                }
                if self.persist() {
                    if let Err(err) = self.pedal.clear() {
                        warn!("failed to remove dead man's pedal: {err}");
                    }
                }
            }
            Ok(_) => {}
            Err(err) => warn!("failed to read dead man's pedal: {err}"),
        }

        let user_plugins = SnapshotFile::new(self.config.plugins_file()).load();
        self.list.merge(&user_plugins, MergePolicy::KeepExisting);
        self.persist();
        debug!(
            "worker ready with {} known plugins, formats {:?}",
            self.list.len(),
            self.formats
        );
    }

    fn scan<W: Write>(
        &mut self,
        formats: &[String],
        writer: &FrameWriter<W>,
        quit: &AtomicBool,
    ) -> Result<()> {
        if !self.snapshot.exists() {
            send_state(writer, WorkerPhase::Scanning)?;
            send_state(writer, WorkerPhase::Finished)?;
            return Ok(());
        }

        send_state(writer, WorkerPhase::Scanning)?;
        for name in formats {
            if quit.load(Ordering::SeqCst) {
                return Ok(());
            }
            match self.formats.get(name) {
                Some(handler) => self.scan_format(handler.as_ref(), writer, quit)?,
                None => warn!("no handler for plugin format {name}"),
            }
        }
        self.persist();
        send_state(writer, WorkerPhase::Finished)
    }

    fn scan_format<W: Write>(
        &mut self,
        handler: &dyn FormatHandler,
        writer: &FrameWriter<W>,
        quit: &AtomicBool,
    ) -> Result<()> {
        let mut paths = self.config.search_paths_for(handler.name());
        paths.extend(handler.default_locations());
        let candidates = handler.search_paths_for_plugins(&paths, self.config.max_depth);
        info!("scanning {} {} candidates", candidates.len(), handler.name());

        let total = candidates.len() as f32;
        for (index, file) in candidates.iter().enumerate() {
            if quit.load(Ordering::SeqCst) {
                break;
            }
            writer.send(&Message::name(file))?;
            self.scan_file(handler, file);
            writer.send(&Message::progress((index + 1) as f32 / total))?;
        }
        Ok(())
    }

    fn scan_file(&mut self, handler: &dyn FormatHandler, file: &str) {
        let id = PluginId::new(handler.name(), file);
        if self.list.contains(&id) || self.list.is_blacklisted(file) {
            debug!("skipping {id}, already known");
            return;
        }

        if let Err(err) = self.pedal.record(file) {
            warn!("failed to arm dead man's pedal for {file}: {err}");
        }
        let result = handler.probe(file);
        if let Err(err) = self.pedal.clear() {
            warn!("failed to release dead man's pedal: {err}");
        }

        match result {
            Ok(descriptor) => {
                debug!("found {} in {file}", descriptor.name);
                self.list.insert(descriptor);
            }
            Err(err) => {
                warn!("probing {file} failed: {err}");
                self.list.add_to_blacklist(file);
            }
        }
        self.persist();
    }

    fn persist(&self) -> bool {
        match self.snapshot.write(&self.list) {
            Ok(()) => true,
            Err(err) => {
                warn!(
                    "failed to write plugin list {}: {err}",
                    self.snapshot.path().display()
                );
                false
            }
        }
    }
}

fn send_state<W: Write>(writer: &FrameWriter<W>, phase: WorkerPhase) -> Result<()> {
    writer
        .send(&Message::state(&phase))
        .with_context(|| format!("failed to announce {phase} to master"))
}

/// Entry point for an executable started with [`crate::WORKER_MODE_ID`]:
/// serves the supervisor over stdin/stdout.
pub fn run_worker(args: WorkerArgs, formats: FormatManager) -> Result<()> {
    let slave = ScannerSlave::new(args.into_config(), formats);
    slave.run(std::io::stdin(), std::io::stdout())
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use harmoniq_plugin_db::PluginDescriptor;
    use pretty_assertions::assert_eq;
    use tempfile::tempdir;

    use super::*;
    use crate::fake::{fake_formats, FAKE_FORMAT};

    struct Harness {
        to_slave: Option<FrameWriter<os_pipe::PipeWriter>>,
        from_slave: FrameReader<os_pipe::PipeReader>,
        handle: thread::JoinHandle<Result<()>>,
    }

    impl Harness {
        fn start(config: ScannerConfig) -> Self {
            let (master_reader, slave_writer) = os_pipe::pipe().unwrap();
            let (slave_reader, master_writer) = os_pipe::pipe().unwrap();
            let slave = ScannerSlave::new(config, fake_formats());
            let handle = thread::spawn(move || slave.run(slave_reader, slave_writer));
            Self {
                to_slave: Some(FrameWriter::new(master_writer)),
                from_slave: FrameReader::new(master_reader),
                handle,
            }
        }

        fn send(&self, message: Message) {
            self.to_slave.as_ref().unwrap().send(&message).unwrap();
        }

        fn recv(&mut self) -> Message {
            self.from_slave.recv().unwrap().unwrap()
        }

        /// Collects messages up to and including the given phase.
        fn recv_until(&mut self, phase: WorkerPhase) -> Vec<Message> {
            let mut messages = Vec::new();
            loop {
                let message = self.recv();
                let done = message == Message::state(&phase);
                messages.push(message);
                if done {
                    return messages;
                }
            }
        }

        fn finish(mut self) {
            self.to_slave.take();
            self.handle.join().unwrap().unwrap();
        }
    }

    fn plugin_dir(root: &std::path::Path, files: &[(&str, &str)]) -> PathBuf {
        let dir = root.join("plugins");
        fs::create_dir_all(&dir).unwrap();
        for (name, contents) in files {
            fs::write(dir.join(name), contents).unwrap();
        }
        dir
    }

    #[test]
    fn announces_waiting_then_ready() {
        let dir = tempdir().unwrap();
        let mut harness = Harness::start(ScannerConfig::with_data_dir(dir.path()));
        assert_eq!(harness.recv(), Message::state(&WorkerPhase::Waiting));
        assert_eq!(harness.recv(), Message::state(&WorkerPhase::Ready));
        harness.send(Message::quit());
        assert_eq!(harness.recv(), Message::state(&WorkerPhase::Quitting));
        harness.finish();
    }

    #[test]
    fn scan_reports_names_progress_and_persists() {
        let dir = tempdir().unwrap();
        let plugins = plugin_dir(dir.path(), &[("a.fake", "ok"), ("b.fake", "fail")]);
        let mut config = ScannerConfig::with_data_dir(dir.path());
        config.add_search_path(FAKE_FORMAT, &plugins);

        let mut harness = Harness::start(config.clone());
        harness.recv_until(WorkerPhase::Ready);
        harness.send(Message::scan(&[FAKE_FORMAT]));
        let messages = harness.recv_until(WorkerPhase::Finished);

        let a = plugins.join("a.fake").display().to_string();
        let b = plugins.join("b.fake").display().to_string();
        assert_eq!(
            messages,
            vec![
                Message::state(&WorkerPhase::Scanning),
                Message::name(&a),
                Message::progress(0.5),
                Message::name(&b),
                Message::progress(1.0),
                Message::state(&WorkerPhase::Finished),
            ]
        );

        let snapshot = config.snapshot().load();
        assert!(snapshot.contains(&PluginId::new(FAKE_FORMAT, a)));
        assert!(snapshot.is_blacklisted(&b));
        assert!(!config.pedal().exists());
        harness.finish();
    }

    #[test]
    fn missing_snapshot_finishes_without_work() {
        let dir = tempdir().unwrap();
        let plugins = plugin_dir(dir.path(), &[("a.fake", "ok")]);
        let mut config = ScannerConfig::with_data_dir(dir.path());
        config.add_search_path(FAKE_FORMAT, &plugins);

        let mut harness = Harness::start(config.clone());
        harness.recv_until(WorkerPhase::Ready);
        config.snapshot().delete().unwrap();
        harness.send(Message::scan(&[FAKE_FORMAT]));
        assert_eq!(
            harness.recv_until(WorkerPhase::Finished),
            vec![
                Message::state(&WorkerPhase::Scanning),
                Message::state(&WorkerPhase::Finished),
            ]
        );
        assert!(!config.snapshot().exists());
        harness.finish();
    }

    #[test]
    fn startup_consumes_pedal_and_merges_user_plugins() {
        let dir = tempdir().unwrap();
        let config = ScannerConfig::with_data_dir(dir.path());
        config.pedal().record("/plugins/crashy.fake").unwrap();
        let mut user = PluginRegistry::new();
        user.insert(PluginDescriptor::unverified(FAKE_FORMAT, "/plugins/crashy.fake"));
        user.insert(PluginDescriptor::unverified(FAKE_FORMAT, "/plugins/known.fake"));
        SnapshotFile::new(config.plugins_file()).write(&user).unwrap();

        let mut harness = Harness::start(config.clone());
        harness.recv_until(WorkerPhase::Ready);

        let snapshot = config.snapshot().load();
        assert!(snapshot.is_blacklisted("/plugins/crashy.fake"));
        assert!(snapshot.type_for_file("/plugins/crashy.fake").is_none());
        assert!(snapshot.type_for_file("/plugins/known.fake").is_some());
        assert!(!config.pedal().exists());
        harness.finish();
    }

    #[test]
    fn known_and_blacklisted_files_are_not_probed_again() {
        let dir = tempdir().unwrap();
        // Both would panic if probed.
        let plugins = plugin_dir(dir.path(), &[("a.fake", "crash"), ("b.fake", "crash")]);
        let mut config = ScannerConfig::with_data_dir(dir.path());
        config.add_search_path(FAKE_FORMAT, &plugins);
        let mut seeded = PluginRegistry::new();
        seeded.insert(PluginDescriptor::unverified(
            FAKE_FORMAT,
            plugins.join("a.fake").display().to_string(),
        ));
        seeded.add_to_blacklist(plugins.join("b.fake").display().to_string());
        config.snapshot().write(&seeded).unwrap();

        let mut harness = Harness::start(config.clone());
        harness.recv_until(WorkerPhase::Ready);
        harness.send(Message::scan(&[FAKE_FORMAT]));
        harness.recv_until(WorkerPhase::Finished);
        assert_eq!(config.snapshot().load(), seeded);
        harness.finish();
    }
}
