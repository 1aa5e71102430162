//! The fuzzing loop: owns the corpus, drives mutate → send → observe →
//! classify, and grows the corpus whenever the target walks a new path.

use std::{hash::Hasher, time::Duration};

use ahash::AHasher;
use hashbrown::HashSet;
use log::{debug, info, warn};
use prost_reflect::DynamicMessage;
use tokio::sync::{mpsc, watch};
use typed_builder::TypedBuilder;

use crate::{
    analysis::{transition_matrix, value_relations, TransitionMatrix, ValueRelation},
    bolts::{
        current_millis,
        os::{MemoryDump, ProcessSupervisor, ProcessUpdate},
        rands::StdRand,
    },
    capture::TypedMessage,
    corpus::{
        extract_chains,
        scheduler::{assign_energy, rank, EnergyInputs},
        Corpus, CorpusEntry, MessageChain,
    },
    events::{classifier, EventSubscriber},
    executors::RpcExecutor,
    mutators::{MutationMode, SchemaMutator},
    observers::{first_coverage_delta, is_new_path, CoverageAgent, HandlerSpec},
    stats::{output::to_hex, output::CrashRecord, output::OutputSink, SimpleStats},
    Error,
};

/// Target-liveness poll tick.
const TARGET_POLL: Duration = Duration::from_secs(1);

/// Everything the run mutates: corpus, chains, analysis results, RNG and
/// the dedupe sets. Owned exclusively by the main task.
#[derive(Debug)]
pub struct FuzzState {
    /// The RNG driving every random decision
    pub rand: StdRand,
    /// The evolving corpus
    pub corpus: Corpus,
    /// Chains derived from the transition matrix
    pub chains: Vec<MessageChain>,
    /// Value hand-offs mined from the capture
    pub relations: Vec<ValueRelation>,
    /// Temporal co-occurrence of request paths
    pub matrix: TransitionMatrix,
    crash_signatures: HashSet<u64>,
    hang_signatures: HashSet<u64>,
    stderr_snapshot: String,
    supervisor_updates: Option<mpsc::Receiver<ProcessUpdate>>,
}

impl FuzzState {
    /// Builds the initial state from a decoded capture.
    ///
    /// Fails with [`Error::EmptyCorpus`] before anything dials the target
    /// if the capture held no decodable request.
    pub fn from_capture(messages: &[TypedMessage], rand: StdRand) -> Result<Self, Error> {
        let corpus = Corpus::from_capture(messages);
        if corpus.is_empty() {
            return Err(Error::EmptyCorpus);
        }
        let matrix = transition_matrix(messages);
        let relations = value_relations(messages);
        let chains = extract_chains(&matrix, &corpus, messages);
        info!(
            "corpus: {} entries, {} chains, {} value relations",
            corpus.len(),
            chains.len(),
            relations.len()
        );
        Ok(Self {
            rand,
            corpus,
            chains,
            relations,
            matrix,
            crash_signatures: HashSet::new(),
            hang_signatures: HashSet::new(),
            stderr_snapshot: String::new(),
            supervisor_updates: None,
        })
    }
}

/// What one send attempt came to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Ok,
    Crash,
    Hang,
    /// Nothing recordable happened; the energy is still spent
    Skipped,
    /// The mutator declined the entry; spend no more energy on it
    Exhausted,
}

/// The fuzzer: wiring of executor, instrumentation, supervision and
/// output around the iteration state machine.
#[derive(TypedBuilder)]
pub struct IpcFuzzer {
    executor: RpcExecutor,
    agent: Box<dyn CoverageAgent>,
    events: Box<dyn EventSubscriber>,
    supervisor: ProcessSupervisor,
    output: OutputSink,
    stats: SimpleStats,
    /// RPC path → instrumentation target bindings
    handlers: Vec<HandlerSpec>,
    mutation_mode: MutationMode,
    /// `false` selects chain-aware sending
    #[builder(default = true)]
    dependency_unaware: bool,
    #[builder(default = true)]
    use_instrumentation: bool,
    #[builder(default = false)]
    perform_dry_run: bool,
    /// Absolute ceiling for mutated payloads
    max_msg_size: usize,
    #[builder(default)]
    memory_dump: Option<MemoryDump>,
    /// Field names never mutated, from configuration
    #[builder(default)]
    ignored_fields: Vec<String>,
    cancel: watch::Receiver<bool>,
    #[builder(default, setter(skip))]
    mutator: SchemaMutator,
    #[builder(default = false, setter(skip))]
    agent_attached: bool,
}

impl IpcFuzzer {
    /// Runs the whole fuzzing campaign until the queue is exhausted or a
    /// shutdown is requested.
    pub async fn run(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        self.stats.handle().update(|s| s.start_time_millis = current_millis());
        if let Err(err) = self.events.start() {
            warn!("event capture unavailable: {err}");
        }

        let refresher = self.spawn_refresher();
        let result = self.run_inner(state).await;
        refresher.abort();

        self.teardown();
        result
    }

    async fn run_inner(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        self.wait_target_up(state).await?;

        if self.perform_dry_run {
            self.dry_run(state).await?;
        }
        if self.use_instrumentation {
            self.calibrate(state).await?;
        }
        self.assign_energies(state);

        if self.dependency_unaware {
            self.fuzz_unaware(state).await
        } else {
            self.fuzz_chains(state).await
        }
    }

    fn spawn_refresher(&self) -> tokio::task::JoinHandle<()> {
        let stats = self.stats.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tick.tick().await;
                stats.display("RUN");
            }
        })
    }

    fn teardown(&mut self) {
        if self.use_instrumentation {
            if let Err(err) = self.agent.unload() {
                warn!("agent unload failed: {err}");
            }
            if let Err(err) = self.agent.stop() {
                warn!("agent stop failed: {err}");
            }
        }
        self.events.stop();
        if let Err(err) = self.output.save_progress(&self.stats.handle().snapshot()) {
            warn!("could not persist progress: {err}");
        }
        self.stats.display("DONE");
    }

    fn cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    async fn sleep_or_cancel(&self, wait: Duration) {
        let mut cancel = self.cancel.clone();
        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = cancel.changed() => {}
        }
    }

    /// Polls until the target is alive, starting it when it is not.
    async fn wait_target_up(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        loop {
            if self.cancelled() {
                return Err(Error::ShuttingDown);
            }
            if self.supervisor.is_running() {
                return Ok(());
            }
            match self.supervisor.start() {
                Ok(updates) => {
                    state.supervisor_updates = Some(updates);
                    state.stderr_snapshot.clear();
                    // A fresh process needs a fresh agent session.
                    self.agent_attached = false;
                }
                Err(err) => warn!("target start failed, retrying: {err}"),
            }
            self.sleep_or_cancel(TARGET_POLL).await;
        }
    }

    /// Pulls whatever the supervisor reported since the last look.
    fn drain_supervisor(&mut self, state: &mut FuzzState) {
        if let Some(updates) = &mut state.supervisor_updates {
            while let Ok(update) = updates.try_recv() {
                match update {
                    ProcessUpdate::Stderr(snapshot) => state.stderr_snapshot = snapshot,
                    ProcessUpdate::Exit(code) => debug!("target exit observed ({code:?})"),
                    ProcessUpdate::Failed(reason) => warn!("supervisor: {reason}"),
                }
            }
        }
    }

    fn find_handler(&self, path: &str) -> Option<&HandlerSpec> {
        let wanted = path.trim_start_matches('/');
        self.handlers
            .iter()
            .find(|h| h.method.trim_start_matches('/') == wanted)
    }

    /// Attaches the agent and binds the handler for this path, once per
    /// target lifetime.
    fn ensure_agent(&mut self, path: &str) {
        if !self.use_instrumentation || self.agent_attached {
            return;
        }
        let Some(handler) = self.find_handler(path).cloned() else {
            debug!("no instrumentation handler bound for {path}");
            return;
        };
        match self.agent.start(&self.supervisor.exec_name(), &handler) {
            Ok(()) => self.agent_attached = true,
            Err(err) => warn!("{err}"),
        }
    }

    /// Sends the first corpus message untouched; any error is fatal.
    async fn dry_run(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        let entry = state
            .corpus
            .get(0)
            .ok_or(Error::EmptyCorpus)?
            .clone();
        info!("dry run: sending {} unmutated", entry.path);
        self.executor
            .send(&entry.path, entry.payload.clone())
            .await
            .map_err(|err| Error::DryRunFailed(format!("{err}")))?;
        self.stats.handle().update(|s| s.total_executions += 1);
        Ok(())
    }

    /// Sends every entry once, unmutated, to observe its baseline
    /// coverage and execution time.
    async fn calibrate(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        for idx in 0..state.corpus.len() {
            if self.cancelled() {
                return Err(Error::ShuttingDown);
            }
            self.wait_target_up(state).await?;

            let entry = state.corpus.get(idx).unwrap().clone();
            self.ensure_agent(&entry.path);
            if let Err(err) = self.agent.clear_coverage() {
                debug!("{err}");
            }

            if let Err(err) = self.executor.send(&entry.path, entry.payload.clone()).await {
                warn!("calibration send for {} failed: {err}", entry.path);
                continue;
            }
            self.stats.handle().update(|s| s.total_executions += 1);

            match (self.agent.get_coverage(), self.agent.get_last_exec_time()) {
                (Ok(coverage), Ok(exec_time)) => {
                    let entry = state.corpus.get_mut(idx).unwrap();
                    entry.coverage = coverage;
                    entry.exec_time_micros = exec_time;
                }
                (Err(err), _) | (_, Err(err)) => warn!("{err}"),
            }
            if let Err(err) = self.agent.clear_coverage() {
                debug!("{err}");
            }
        }
        Ok(())
    }

    /// Scores entries and chains from their observed triples; the tail
    /// entry of every chain mirrors the chain's energy.
    fn assign_energies(&self, state: &mut FuzzState) {
        let inputs: Vec<EnergyInputs> = state
            .corpus
            .iter()
            .map(|entry| EnergyInputs {
                exec_time_micros: entry.exec_time_micros,
                coverage_blocks: entry.coverage.len(),
                field_count: entry.field_count(),
            })
            .collect();
        let energies = assign_energy(&inputs);
        for (idx, energy) in energies.iter().enumerate() {
            state.corpus.get_mut(idx).unwrap().energy = *energy;
        }

        let chain_inputs: Vec<EnergyInputs> = state
            .chains
            .iter()
            .map(|chain| {
                let tail = state.corpus.get(chain.tail()).unwrap();
                EnergyInputs {
                    exec_time_micros: tail.exec_time_micros,
                    coverage_blocks: tail.coverage.len(),
                    field_count: tail.field_count(),
                }
            })
            .collect();
        let chain_energies = assign_energy(&chain_inputs);
        for (idx, energy) in chain_energies.iter().enumerate() {
            state.chains[idx].energy = *energy;
            let tail = state.chains[idx].tail();
            state.corpus.get_mut(tail).unwrap().energy = *energy;
        }

        let order = rank(&chain_energies);
        let reordered: Vec<MessageChain> =
            order.iter().map(|&i| state.chains[i].clone()).collect();
        state.chains = reordered;
    }

    /// Dependency-unaware sending: distinct messages by energy, each
    /// fuzzed for its energy's worth of iterations.
    async fn fuzz_unaware(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        // Queue of (entry, countdown); first entry per distinct path,
        // highest energy first. Grows as new paths are discovered.
        let mut seen_paths = HashSet::new();
        let mut queue: Vec<(usize, i64)> = Vec::new();
        let energies: Vec<i64> = state.corpus.iter().map(|e| e.energy).collect();
        for idx in rank(&energies) {
            let entry = state.corpus.get(idx).unwrap();
            if seen_paths.insert(entry.path.clone()) {
                queue.push((idx, entry.energy));
            }
        }

        let mut queue_pos = 0;
        while queue_pos < queue.len() {
            let (entry_idx, initial_energy) = queue[queue_pos];
            let mut remaining = initial_energy;

            self.stats.handle().update(|s| {
                s.current_message = state.corpus.get(entry_idx).unwrap().path.clone();
                s.message_progress = 0.0;
            });

            while remaining > 0 {
                if self.cancelled() {
                    return Err(Error::ShuttingDown);
                }
                self.wait_target_up(state).await?;

                let outcome = self
                    .iteration(state, entry_idx, initial_energy, &[], &mut queue)
                    .await?;
                if outcome == Outcome::Exhausted {
                    break;
                }

                remaining -= 1;
                state.corpus.get_mut(entry_idx).unwrap().energy = remaining;
                self.stats.handle().update(|s| {
                    s.message_progress =
                        100.0 * (initial_energy - remaining) as f64 / initial_energy.max(1) as f64;
                });
            }

            if let Err(err) = self.output.save_progress(&self.stats.handle().snapshot()) {
                warn!("could not persist progress: {err}");
            }
            queue_pos += 1;
        }
        Ok(())
    }

    /// Chain-aware sending: replay every chain head unmutated, then fuzz
    /// the tail with the replay responses pinned in.
    async fn fuzz_chains(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        if state.chains.is_empty() {
            info!("no chain of length 2 or more; nothing to fuzz in chain mode");
            return Ok(());
        }

        for chain_idx in 0..state.chains.len() {
            let chain = state.chains[chain_idx].clone();
            let tail_idx = chain.tail();
            let mut remaining = chain.energy;

            self.stats.handle().update(|s| {
                s.current_message = state.corpus.get(tail_idx).unwrap().path.clone();
                s.message_progress = 0.0;
            });

            'energy: while remaining > 0 {
                if self.cancelled() {
                    return Err(Error::ShuttingDown);
                }
                self.wait_target_up(state).await?;

                // Captured responses seed the pins; live replay responses
                // take precedence by coming later.
                let mut dep_messages: Vec<DynamicMessage> = chain
                    .dependencies
                    .iter()
                    .filter_map(|dep| {
                        DynamicMessage::decode(dep.schema.clone(), dep.payload.as_slice()).ok()
                    })
                    .collect();

                for &head_idx in &chain.primary[..chain.primary.len() - 1] {
                    let head = state.corpus.get(head_idx).unwrap().clone();
                    match self.executor.send(&head.path, head.payload.clone()).await {
                        Ok(response) => {
                            self.stats.handle().update(|s| s.total_executions += 1);
                            if let Some(decoded) = self.decode_response(&chain, &head.path, &response)
                            {
                                dep_messages.push(decoded);
                            }
                        }
                        Err(err) => {
                            debug!("chain replay of {} failed: {err}", head.path);
                            self.classify_failure(state, head_idx, err).await?;
                            remaining -= 1;
                            break 'energy;
                        }
                    }
                }

                let outcome = self
                    .iteration(state, tail_idx, chain.energy, &dep_messages, &mut Vec::new())
                    .await?;
                if outcome == Outcome::Exhausted {
                    break;
                }

                remaining -= 1;
                state.corpus.get_mut(tail_idx).unwrap().energy = remaining;
                self.stats.handle().update(|s| {
                    s.message_progress =
                        100.0 * (chain.energy - remaining) as f64 / chain.energy.max(1) as f64;
                });
            }

            if let Err(err) = self.output.save_progress(&self.stats.handle().snapshot()) {
                warn!("could not persist progress: {err}");
            }
        }
        Ok(())
    }

    /// A replay response typed against the captured dependency of the
    /// same path.
    fn decode_response(
        &self,
        chain: &MessageChain,
        path: &str,
        response: &[u8],
    ) -> Option<DynamicMessage> {
        let dep = chain.dependencies.iter().find(|dep| dep.path == path)?;
        match DynamicMessage::decode(dep.schema.clone(), response) {
            Ok(decoded) => Some(decoded),
            Err(err) => {
                debug!("replay response for {path} does not decode: {err}");
                None
            }
        }
    }

    /// One MUTATE → SEND → OBSERVE → CLASSIFY pass over an entry.
    async fn iteration(
        &mut self,
        state: &mut FuzzState,
        entry_idx: usize,
        initial_energy: i64,
        dep_messages: &[DynamicMessage],
        queue: &mut Vec<(usize, i64)>,
    ) -> Result<Outcome, Error> {
        self.stats.handle().update(|s| s.iteration += 1);

        // MUTATE
        let entry = state.corpus.get(entry_idx).unwrap().clone();
        let mut parsed =
            match DynamicMessage::decode(entry.schema.clone(), entry.payload.as_slice()) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("entry for {} stopped decoding: {err}", entry.path);
                    return Ok(Outcome::Exhausted);
                }
            };
        let mut payload = entry.payload.clone();
        let relations: Vec<ValueRelation> = if dep_messages.is_empty() {
            Vec::new()
        } else {
            state.relations.clone()
        };
        let mode = if dep_messages.is_empty() {
            self.mutation_mode
        } else {
            // Chain tails get single-field mutations, the pins do the rest.
            MutationMode::SingleField
        };
        if let Err(err) = self.mutator.mutate(
            &mut parsed,
            &mut payload,
            mode,
            &self.ignored_fields,
            self.max_msg_size,
            &mut state.rand,
            &relations,
            dep_messages,
        ) {
            warn!("mutation failed on {}: {err}", entry.path);
            return Ok(Outcome::Exhausted);
        }
        state.corpus.get_mut(entry_idx).unwrap().payload = payload.clone();

        // SEND
        self.ensure_agent(&entry.path);
        let send_result = self.executor.send(&entry.path, payload).await;
        self.stats.handle().update(|s| s.total_executions += 1);

        match send_result {
            Ok(_) => {
                // OBSERVE
                if self.use_instrumentation {
                    self.observe(state, entry_idx, initial_energy, queue);
                }
                Ok(Outcome::Ok)
            }
            Err(err) => self.classify_failure(state, entry_idx, err).await,
        }
    }

    /// Pulls and clears coverage, growing the corpus when the fingerprint
    /// moved.
    fn observe(
        &mut self,
        state: &mut FuzzState,
        entry_idx: usize,
        initial_energy: i64,
        queue: &mut Vec<(usize, i64)>,
    ) {
        let observed = match self.agent.get_coverage() {
            Ok(observed) => observed,
            Err(err) => {
                // Tolerated: this iteration's coverage is discarded.
                warn!("{err}");
                return;
            }
        };
        let exec_time = self.agent.get_last_exec_time().unwrap_or(0);
        if let Err(err) = self.agent.clear_coverage() {
            warn!("{err}");
        }

        let entry = state.corpus.get(entry_idx).unwrap();
        if observed.is_empty() || !is_new_path(&entry.coverage, &observed) {
            return;
        }

        let new_entry = CorpusEntry {
            path: entry.path.clone(),
            schema: entry.schema.clone(),
            payload: entry.payload.clone(),
            energy: initial_energy,
            coverage: observed,
            exec_time_micros: exec_time,
        };
        let new_idx = state.corpus.add(new_entry);
        queue.push((new_idx, initial_energy));

        self.stats.handle().update(|s| {
            s.new_path_count += 1;
            s.new_path_time_millis = current_millis();
        });
        self.stats.display("PATH");
    }

    /// Maps a send failure to crash/hang against target liveness, and
    /// restarts the target after a crash.
    async fn classify_failure(
        &mut self,
        state: &mut FuzzState,
        entry_idx: usize,
        err: Error,
    ) -> Result<Outcome, Error> {
        self.drain_supervisor(state);
        let alive = self.supervisor.is_running();

        let outcome = match err {
            Error::Network(_) | Error::RpcStatus(_) => {
                if alive {
                    self.record_hang(state, entry_idx);
                    Outcome::Hang
                } else {
                    self.record_crash(state, entry_idx);
                    Outcome::Crash
                }
            }
            // An unclassifiable failure only counts when the target died.
            Error::Unknown(_) => {
                if alive {
                    Outcome::Skipped
                } else {
                    self.record_crash(state, entry_idx);
                    Outcome::Crash
                }
            }
            other => return Err(other),
        };

        if outcome == Outcome::Crash {
            self.restart_target(state).await?;
        }
        Ok(outcome)
    }

    async fn restart_target(&mut self, state: &mut FuzzState) -> Result<(), Error> {
        if self.supervisor.is_running() {
            if let Err(err) = self.supervisor.kill() {
                warn!("{err}");
            }
        }
        self.agent_attached = false;
        self.wait_target_up(state).await
    }

    /// Builds, dedupes and persists a crash record.
    fn record_crash(&mut self, state: &mut FuzzState, entry_idx: usize) {
        let entry = state.corpus.get(entry_idx).unwrap().clone();
        let events = self.events.drain();
        let event_lines: Vec<String> = events.iter().map(|e| e.message.clone()).collect();
        let (code, cause) = classifier::classify(&state.stderr_snapshot, &events);

        let handler = self.find_handler(&entry.path);
        let fault_function = handler.map(|h| h.handler.clone()).unwrap_or_default();
        let module = handler.map(|h| h.module.clone()).unwrap_or_default();

        // Last look at the coverage, if the agent survived the target.
        let delta = self
            .agent
            .get_coverage()
            .ok()
            .as_deref()
            .and_then(|observed| first_coverage_delta(&entry.coverage, observed).cloned());

        let mut hasher = AHasher::default();
        hasher.write(code.as_deref().unwrap_or("").as_bytes());
        hasher.write(fault_function.as_bytes());
        if let Some(block) = &delta {
            hasher.write(block.module.as_bytes());
            hasher.write_u64(block.block_start);
            hasher.write_u64(block.block_end);
        }
        let signature = hasher.finish();

        let unique = state.crash_signatures.insert(signature);
        if unique {
            self.stats.handle().update(|s| {
                s.unique_crash_count += 1;
                s.last_crash_time_millis = current_millis();
            });
        }

        let dump_path = match (&self.memory_dump, unique) {
            (Some(dump), true) => match dump.start_dump() {
                Ok(path) => path.to_string_lossy().into_owned(),
                Err(err) => {
                    warn!("memory dump failed: {err}");
                    String::new()
                }
            },
            _ => String::new(),
        };

        let record = CrashRecord {
            iteration: self.stats.handle().snapshot().iteration,
            error_code: code.unwrap_or_default(),
            cause: cause.to_string(),
            module,
            fault_function,
            method_path: entry.path.clone(),
            process_output: state.stderr_snapshot.clone(),
            events: event_lines,
            dump_path,
            payload_hex: to_hex(&entry.payload),
        };
        match self.output.save_crash(&record) {
            Ok(path) => info!("crash record written to {}", path.display()),
            Err(err) => warn!("could not persist crash record: {err}"),
        }
        self.stats.display("CRASH");
    }

    /// Counts a hang; nothing is persisted for those.
    fn record_hang(&mut self, state: &mut FuzzState, entry_idx: usize) {
        let path = state.corpus.get(entry_idx).unwrap().path.clone();
        let mut hasher = AHasher::default();
        hasher.write(path.as_bytes());
        if state.hang_signatures.insert(hasher.finish()) {
            self.stats.handle().update(|s| {
                s.unique_hang_count += 1;
                s.last_hang_time_millis = current_millis();
            });
        }
        self.stats.display("HANG");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::Direction;
    use crate::events::NullEventSubscriber;
    use crate::observers::{CoverageBlock, NopCoverageAgent};
    use crate::schema::testutil::{compile_schema, HELLO_PROTO};
    use std::path::PathBuf;

    fn request(schemas: &crate::schema::SchemaSet, stream_id: u32) -> TypedMessage {
        let method = schemas.find_method("pkg.Svc/Hello").unwrap();
        TypedMessage {
            path: "/pkg.Svc/Hello".into(),
            direction: Direction::Request,
            stream_id,
            schema: method.input(),
            payload: b"\x0a\x06Jeremy".to_vec(),
        }
    }

    fn test_fuzzer(dir: &std::path::Path) -> IpcFuzzer {
        let (_tx, rx) = watch::channel(false);
        IpcFuzzer::builder()
            .executor(RpcExecutor::new("127.0.0.1", 1, Duration::from_millis(100)))
            .agent(Box::new(NopCoverageAgent))
            .events(Box::new(NullEventSubscriber))
            .supervisor(ProcessSupervisor::new(
                PathBuf::from("/definitely/not/running/svc-under-test"),
                vec![],
            ))
            .output(OutputSink::new(dir).unwrap())
            .stats(SimpleStats::new(|_| {}))
            .handlers(vec![HandlerSpec {
                method: "/pkg.Svc/Hello".into(),
                module: "svc.exe".into(),
                handler: "handle_hello".into(),
            }])
            .mutation_mode(MutationMode::SingleField)
            .max_msg_size(1024)
            .cancel(rx)
            .build()
    }

    fn test_state(messages: &[TypedMessage]) -> FuzzState {
        FuzzState::from_capture(messages, StdRand::with_seed(1)).unwrap()
    }

    #[test]
    fn empty_capture_aborts_before_dialing() {
        match FuzzState::from_capture(&[], StdRand::with_seed(1)) {
            Err(Error::EmptyCorpus) => {}
            other => panic!("expected EmptyCorpus, got {other:?}"),
        }
    }

    #[test]
    fn new_coverage_appends_an_entry_and_counts_the_path() {
        let schemas = compile_schema(HELLO_PROTO);
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = test_fuzzer(dir.path());
        let mut state = test_state(&[request(&schemas, 1)]);

        let block = |start, end| CoverageBlock {
            module: "svc.exe".into(),
            block_start: start,
            block_end: end,
        };
        state.corpus.get_mut(0).unwrap().coverage = vec![block(1, 2), block(3, 4)];

        struct GrowingAgent(Vec<CoverageBlock>);
        impl CoverageAgent for GrowingAgent {
            fn start(&mut self, _: &str, _: &HandlerSpec) -> Result<(), Error> {
                Ok(())
            }
            fn get_coverage(&mut self) -> Result<Vec<CoverageBlock>, Error> {
                Ok(self.0.clone())
            }
            fn get_last_exec_time(&mut self) -> Result<u64, Error> {
                Ok(123)
            }
            fn clear_coverage(&mut self) -> Result<(), Error> {
                Ok(())
            }
            fn unload(&mut self) -> Result<(), Error> {
                Ok(())
            }
            fn stop(&mut self) -> Result<(), Error> {
                Ok(())
            }
        }
        fuzzer.agent = Box::new(GrowingAgent(vec![block(1, 2), block(3, 4), block(5, 6)]));

        let mut queue = Vec::new();
        fuzzer.observe(&mut state, 0, 7, &mut queue);

        assert_eq!(state.corpus.len(), 2);
        assert_eq!(queue, vec![(1, 7)]);
        let added = state.corpus.get(1).unwrap();
        assert_eq!(added.coverage.len(), 3);
        assert_eq!(added.exec_time_micros, 123);
        let status = fuzzer.stats.handle().snapshot();
        assert_eq!(status.new_path_count, 1);
        assert!(status.new_path_time_millis > 0);

        // Same coverage again: nothing grows.
        fuzzer.observe(&mut state, 1, 7, &mut queue);
        assert_eq!(state.corpus.len(), 2);
    }

    #[test]
    fn crashes_dedupe_by_signature_and_write_records() {
        let schemas = compile_schema(HELLO_PROTO);
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = test_fuzzer(dir.path());
        let mut state = test_state(&[request(&schemas, 1)]);
        state.stderr_snapshot = "Exception 0xc0000005 at 0x7ff6a000".into();

        fuzzer.record_crash(&mut state, 0);
        fuzzer.record_crash(&mut state, 0);

        let status = fuzzer.stats.handle().snapshot();
        assert_eq!(status.unique_crash_count, 1);
        assert!(status.last_crash_time_millis > 0);

        let crash_dir = dir.path().join("Crashes");
        let files: Vec<_> = std::fs::read_dir(&crash_dir).unwrap().collect();
        assert!(!files.is_empty());
        let record: CrashRecord = serde_json::from_slice(
            &std::fs::read(files[0].as_ref().unwrap().path()).unwrap(),
        )
        .unwrap();
        assert_eq!(record.error_code, "0xc0000005");
        assert_eq!(record.cause, "memory corruption / null-pointer dereference");
        assert_eq!(record.fault_function, "handle_hello");
        assert_eq!(record.payload_hex, "0a064a6572656d79");
    }

    #[test]
    fn hangs_count_once_per_method_and_write_nothing() {
        let schemas = compile_schema(HELLO_PROTO);
        let dir = tempfile::tempdir().unwrap();
        let mut fuzzer = test_fuzzer(dir.path());
        let mut state = test_state(&[request(&schemas, 1)]);

        fuzzer.record_hang(&mut state, 0);
        fuzzer.record_hang(&mut state, 0);

        let status = fuzzer.stats.handle().snapshot();
        assert_eq!(status.unique_hang_count, 1);
        assert!(status.last_hang_time_millis > 0);
        assert_eq!(
            std::fs::read_dir(dir.path().join("Crashes")).unwrap().count(),
            0
        );
    }

    #[test]
    fn energies_cover_entries_and_mirror_onto_chain_tails() {
        let schemas = compile_schema(HELLO_PROTO);
        let dir = tempfile::tempdir().unwrap();
        let fuzzer = test_fuzzer(dir.path());
        let mut state = test_state(&[request(&schemas, 1), request(&schemas, 3)]);

        fuzzer.assign_energies(&mut state);
        for entry in state.corpus.iter() {
            assert!(entry.energy >= 0);
        }
        for chain in &state.chains {
            assert_eq!(chain.energy, state.corpus.get(chain.tail()).unwrap().energy);
        }
    }
}
