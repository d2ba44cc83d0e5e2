//! Gradient-descent training of a [`ColourNetwork`] on colour samples.
//!
//! [`Session`] owns the network and performs one step at a time on the
//! caller's thread. [`Trainer`] drives a session on a dedicated worker
//! thread, publishes progress through atomics and hands over the finished
//! image and shader source once.

use crate::config::{Parallelism, TrainerConfig};
use crate::engine::Checkpoint;
use crate::error::{Error, Result};
use crate::image::{Image, Sample};
use crate::nn::ColourNetwork;
use crate::shader;
use rand::{rngs::StdRng, thread_rng, SeedableRng};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering},
        Arc, OnceLock,
    },
    thread::{self, JoinHandle},
};
use tracing::{error, info, warn};

/// Index of the sample used by step `iteration`.
pub fn sample_index(iteration: u64, samples: usize) -> usize {
    (iteration % samples as u64) as usize
}

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct StepReport {
    pub iteration: u64,
    pub sample_index: usize,
    pub error: f64,
    /// The step's error beat every earlier one and was checkpointed.
    pub improved: bool,
}

pub struct Session {
    network: ColourNetwork,
    samples: Vec<Sample>,
    learning_rate: f64,
    parallelism: Parallelism,
    iteration: u64,
    last_error: f64,
    best: Option<(f64, Checkpoint<f64>)>,
}

impl Session {
    /// Builds the network and randomizes its parameters. Fails on an empty
    /// sample list or an invalid config.
    pub fn new(samples: Vec<Sample>, config: &TrainerConfig) -> Result<Self> {
        if samples.is_empty() {
            return Err(Error::EmptySamples);
        }
        config.validate()?;

        let mut network = ColourNetwork::new()?;
        match config.seed {
            Some(seed) => network.randomize(&mut StdRng::seed_from_u64(seed))?,
            None => network.randomize(&mut thread_rng())?,
        }

        Ok(Self {
            network,
            samples,
            learning_rate: config.learning_rate,
            parallelism: config.parallelism,
            iteration: 0,
            last_error: f64::INFINITY,
            best: None,
        })
    }

    pub fn step(&mut self) -> Result<StepReport> {
        let never = AtomicBool::new(false);
        self.step_unless(&never)?.ok_or(Error::NotEvaluated)
    }

    /// One training step. Returns `None` when `abort` was raised part-way;
    /// the parameters are then left as they were before the update, but the
    /// error and any new best checkpoint are already recorded.
    pub fn step_unless(&mut self, abort: &AtomicBool) -> Result<Option<StepReport>> {
        let iteration = self.iteration;
        let index = sample_index(iteration, self.samples.len());
        self.iteration += 1;

        self.network.load_sample(&self.samples[index])?;
        let error = self.network.error()?;
        self.last_error = error;

        let improved = error < self.best_error();
        if improved {
            self.best = Some((error, self.network.checkpoint()));
        }

        if abort.load(Ordering::Acquire) {
            return Ok(None);
        }
        let gradients = self.network.gradients(self.parallelism)?;
        if abort.load(Ordering::Acquire) {
            return Ok(None);
        }
        self.network
            .apply_gradients(&gradients, error, self.learning_rate)?;

        Ok(Some(StepReport {
            iteration,
            sample_index: index,
            error,
            improved,
        }))
    }

    /// Error of the most recent forward evaluation, infinite before the
    /// first step.
    pub fn last_error(&self) -> f64 {
        self.last_error
    }

    /// Lowest error seen so far, infinite before the first step.
    pub fn best_error(&self) -> f64 {
        self.best
            .as_ref()
            .map_or(f64::INFINITY, |(error, _)| *error)
    }

    /// Puts the best checkpoint back. Returns false if no step has run.
    pub fn restore_best(&mut self) -> bool {
        match &self.best {
            Some((_, checkpoint)) => {
                self.network.restore(checkpoint);
                true
            }
            None => false,
        }
    }

    /// Number of steps started so far.
    pub fn iterations(&self) -> u64 {
        self.iteration
    }

    pub fn samples(&self) -> &[Sample] {
        &self.samples
    }

    pub fn network(&self) -> &ColourNetwork {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut ColourNetwork {
        &mut self.network
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum TrainerState {
    Created = 0,
    Running = 1,
    /// Stop requested; finishing the current step and running inference.
    Stopping = 2,
    Done = 3,
    Aborted = 4,
}

impl TrainerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => TrainerState::Created,
            1 => TrainerState::Running,
            2 => TrainerState::Stopping,
            3 => TrainerState::Done,
            _ => TrainerState::Aborted,
        }
    }
}

pub struct TrainingRequest {
    pub image: Image,
    pub samples: Vec<Sample>,
    pub config: TrainerConfig,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TrainingOutput {
    /// The source image run through the best parameters. Partial if aborted.
    pub image: Image,
    pub shader: String,
    pub best_error: f64,
    pub iterations: u64,
}

struct Shared {
    state: AtomicU8,
    run: AtomicBool,
    abort: AtomicBool,
    done: AtomicBool,
    last_error: AtomicU64,
    best_error: AtomicU64,
    iterations: AtomicU64,
    outcome: OnceLock<Result<TrainingOutput>>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(TrainerState::Created as u8),
            run: AtomicBool::new(false),
            abort: AtomicBool::new(false),
            done: AtomicBool::new(false),
            last_error: AtomicU64::new(f64::INFINITY.to_bits()),
            best_error: AtomicU64::new(f64::INFINITY.to_bits()),
            iterations: AtomicU64::new(0),
            outcome: OnceLock::new(),
        }
    }

    fn set_state(&self, state: TrainerState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn request_stop(&self) {
        self.run.store(false, Ordering::Release);
        let _ = self.state.compare_exchange(
            TrainerState::Running as u8,
            TrainerState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn publish(&self, session: &Session) {
        self.last_error
            .store(session.last_error().to_bits(), Ordering::Relaxed);
        self.best_error
            .store(session.best_error().to_bits(), Ordering::Relaxed);
        self.iterations
            .store(session.iterations(), Ordering::Relaxed);
    }

    fn should_continue(&self) -> bool {
        self.run.load(Ordering::Acquire) && !self.abort.load(Ordering::Acquire)
    }
}

/// Handle on a training run executing on its own thread.
///
/// Dropping the handle aborts the run and joins the thread.
pub struct Trainer {
    shared: Arc<Shared>,
    handle: Option<JoinHandle<()>>,
}

impl Trainer {
    /// Validates the request and starts the worker.
    pub fn start(request: TrainingRequest) -> Result<Self> {
        let TrainingRequest {
            image,
            samples,
            config,
        } = request;
        let session = Session::new(samples, &config)?;

        let shared = Arc::new(Shared::new());
        shared.run.store(true, Ordering::Release);
        shared.set_state(TrainerState::Running);

        let worker_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name("colourgrad-trainer".to_string())
            .spawn(move || work(&worker_shared, session, &image, &config))
            .map_err(|err| Error::Spawn(err.to_string()))?;

        Ok(Self {
            shared,
            handle: Some(handle),
        })
    }

    /// Asks the worker to finish the current step and move on to inference.
    /// Calling it again is a no-op.
    pub fn stop(&self) {
        self.shared.request_stop();
    }

    /// Stops training and inference as soon as the worker notices.
    pub fn abort(&self) {
        // Raised first so a worker that sees the run flag drop also sees this.
        self.shared.abort.store(true, Ordering::Release);
        self.shared.request_stop();
    }

    pub fn state(&self) -> TrainerState {
        TrainerState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    pub fn is_running(&self) -> bool {
        self.state() == TrainerState::Running
    }

    pub fn is_done(&self) -> bool {
        self.shared.done.load(Ordering::Acquire)
    }

    pub fn last_error(&self) -> f64 {
        f64::from_bits(self.shared.last_error.load(Ordering::Relaxed))
    }

    pub fn best_error(&self) -> f64 {
        f64::from_bits(self.shared.best_error.load(Ordering::Relaxed))
    }

    pub fn iterations(&self) -> u64 {
        self.shared.iterations.load(Ordering::Relaxed)
    }

    /// The finished image and shader, once [`Trainer::is_done`].
    pub fn result(&self) -> Option<&TrainingOutput> {
        self.outcome()?.as_ref().ok()
    }

    /// The error that ended the run, if it failed.
    pub fn failure(&self) -> Option<&Error> {
        self.outcome()?.as_ref().err()
    }

    fn outcome(&self) -> Option<&Result<TrainingOutput>> {
        if !self.is_done() {
            return None;
        }
        self.shared.outcome.get()
    }

    /// Waits for the worker to finish and returns its outcome. Does not
    /// stop the run by itself.
    pub fn join(mut self) -> Result<TrainingOutput> {
        if let Some(handle) = self.handle.take() {
            handle.join().map_err(|_| Error::WorkerPanicked)?;
        }
        self.shared
            .outcome
            .get()
            .cloned()
            .unwrap_or(Err(Error::WorkerPanicked))
    }
}

impl Drop for Trainer {
    fn drop(&mut self) {
        self.abort();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("training worker panicked");
            }
        }
    }
}

fn work(shared: &Shared, session: Session, image: &Image, config: &TrainerConfig) {
    let outcome = train_and_render(shared, session, image, config);

    let aborted = shared.abort.load(Ordering::Acquire);
    match &outcome {
        Err(err) => error!(%err, "training failed"),
        Ok(_) if aborted => warn!("training aborted; result may be partial"),
        Ok(output) => info!(
            iterations = output.iterations,
            best_error = output.best_error,
            "training finished"
        ),
    }

    // Publish before raising `done`.
    let failed = outcome.is_err();
    if shared.outcome.set(outcome).is_err() {
        warn!("training outcome already published; keeping the first");
    }
    shared.set_state(if aborted || failed {
        TrainerState::Aborted
    } else {
        TrainerState::Done
    });
    shared.done.store(true, Ordering::Release);
}

fn train_and_render(
    shared: &Shared,
    mut session: Session,
    image: &Image,
    config: &TrainerConfig,
) -> Result<TrainingOutput> {
    info!(
        samples = session.samples().len(),
        parameters = session.network().trainable_count(),
        learning_rate = config.learning_rate,
        "training started"
    );

    while shared.should_continue() {
        let report = session.step_unless(&shared.abort)?;
        // Also after an interrupted step: its error and checkpoint count.
        shared.publish(&session);
        let Some(report) = report else {
            break;
        };

        if report.improved {
            info!(iteration = report.iteration, error = report.error, "new best error");
        }
        if config.max_iterations == Some(report.iteration + 1) {
            shared.request_stop();
        }
    }

    let best_error = session.best_error();
    let iterations = session.iterations();
    if !session.restore_best() {
        warn!("stopped before the first step; rendering with initial parameters");
    }
    info!(iterations, best_error, "training stopped, rendering");

    let network = session.network();
    let (image, shader) = rayon::join(
        || network.transform(image, &shared.abort, config.parallelism),
        || shader::glsl(network),
    );

    Ok(TrainingOutput {
        image: image?,
        shader: shader?,
        best_error,
        iterations,
    })
}
