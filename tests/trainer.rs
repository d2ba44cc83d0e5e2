use colourgrad::{
    Error, Image, Parallelism, Rgb, Sample, Trainer, TrainerConfig, TrainerState, TrainingRequest,
};
use std::{
    thread,
    time::{Duration, Instant},
};

fn image() -> Image {
    Image::from_fn(12, 8, |x, y| Rgb::new(x as f64 / 11.0, y as f64 / 7.0, 0.3))
}

fn samples() -> Vec<Sample> {
    vec![
        Sample::new(Rgb::new(1.0, 0.0, 0.0), Rgb::new(0.0, 0.2, 1.0)),
        Sample::new(Rgb::new(0.0, 0.0, 0.0), Rgb::new(0.1, 0.1, 0.1)),
    ]
}

fn request(config: TrainerConfig) -> TrainingRequest {
    TrainingRequest {
        image: image(),
        samples: samples(),
        config,
    }
}

fn wait_for<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out");
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn bounded_run_completes() {
    let config = TrainerConfig::default().with_seed(3).with_max_iterations(200);
    let trainer = Trainer::start(request(config)).unwrap();

    wait_for(|| trainer.is_done());
    assert_eq!(trainer.state(), TrainerState::Done);
    assert!(!trainer.is_running());
    assert_eq!(trainer.iterations(), 200);
    assert!(trainer.best_error() <= trainer.last_error());

    let published = trainer.result().cloned().unwrap();
    assert!(trainer.failure().is_none());

    let output = trainer.join().unwrap();
    assert_eq!(output, published);
    assert_eq!(output.iterations, 200);
    assert_eq!(output.image.width(), 12);
    assert_eq!(output.image.height(), 8);
    assert!(output.shader.starts_with("mat4x4 a = mat4x4("));
    assert!(output.shader.ends_with("col = b * tanh(a * vec4(col, 1.0)) + c;"));
    assert!(output
        .image
        .pixels()
        .iter()
        .flat_map(|c| c.channels())
        .all(|v| (0.0..=1.0).contains(&v)));
}

#[test]
fn seeded_runs_are_reproducible() {
    let run = |parallelism| {
        let config = TrainerConfig::default()
            .with_seed(99)
            .with_max_iterations(60)
            .with_parallelism(parallelism);
        Trainer::start(request(config)).unwrap();
    };
    // Starting and dropping must not hang even before the first poll.
    run(Parallelism::Sequential);

    let output = |parallelism| {
        let config = TrainerConfig::default()
            .with_seed(99)
            .with_max_iterations(60)
            .with_parallelism(parallelism);
        Trainer::start(request(config)).unwrap().join().unwrap()
    };
    assert_eq!(output(Parallelism::Sequential), output(Parallelism::Parallel));
}

#[test]
fn stop_is_graceful_and_idempotent() {
    let trainer = Trainer::start(request(TrainerConfig::default().with_seed(5))).unwrap();
    assert!(trainer.is_running());

    wait_for(|| trainer.iterations() >= 10);
    trainer.stop();
    trainer.stop();
    assert!(!trainer.is_running());

    wait_for(|| trainer.is_done());
    trainer.stop();
    assert_eq!(trainer.state(), TrainerState::Done);

    let best = trainer.best_error();
    let output = trainer.join().unwrap();
    assert_eq!(output.best_error, best);
    assert!(output.iterations >= 10);
}

#[test]
fn abort_still_publishes_a_result() {
    let trainer = Trainer::start(request(TrainerConfig::default())).unwrap();
    wait_for(|| trainer.iterations() >= 1);
    trainer.abort();

    wait_for(|| trainer.is_done());
    assert_eq!(trainer.state(), TrainerState::Aborted);
    assert!(trainer.failure().is_none());

    let best = trainer.best_error();
    let output = trainer.join().unwrap();
    assert_eq!(output.best_error, best);
    assert_eq!(output.image.width(), 12);
    assert!(output.shader.contains("vec3 c = vec3("));
}

#[test]
fn stop_then_abort_always_terminates() {
    // Big enough that inference is still running when the abort lands.
    let large = || {
        Image::from_fn(200, 200, |x, y| {
            Rgb::new(x as f64 / 199.0, y as f64 / 199.0, 0.3)
        })
    };
    for seed in 0..5 {
        let trainer = Trainer::start(TrainingRequest {
            image: large(),
            samples: samples(),
            config: TrainerConfig::default().with_seed(seed),
        })
        .unwrap();
        thread::sleep(Duration::from_millis(2));
        trainer.stop();
        trainer.abort();
        trainer.stop();

        wait_for(|| trainer.is_done());
        assert_eq!(trainer.state(), TrainerState::Aborted);
        assert!(trainer.failure().is_none());

        let published = trainer.result().cloned().unwrap();
        assert_eq!(trainer.best_error(), published.best_error);
        assert_eq!(trainer.iterations(), published.iterations);
        assert_eq!(trainer.join().unwrap(), published);
    }
}

#[test]
fn drop_without_stop_joins_the_worker() {
    let trainer = Trainer::start(request(TrainerConfig::default())).unwrap();
    wait_for(|| trainer.iterations() >= 1);
    drop(trainer);
}

#[test]
fn nothing_is_published_while_running() {
    // Unbounded: only a stop or abort ends this run.
    let trainer = Trainer::start(request(TrainerConfig::default())).unwrap();
    assert!(!trainer.is_done());
    assert!(trainer.result().is_none());
    assert!(trainer.failure().is_none());
    trainer.abort();
    wait_for(|| trainer.is_done());
    assert!(trainer.result().is_some());
}

#[test]
fn invalid_requests_fail_before_starting() {
    let empty = TrainingRequest {
        image: image(),
        samples: Vec::new(),
        config: TrainerConfig::default(),
    };
    assert_eq!(Trainer::start(empty).err(), Some(Error::EmptySamples));

    let bad_rate = request(TrainerConfig::default().with_learning_rate(f64::NAN));
    assert!(matches!(
        Trainer::start(bad_rate).err(),
        Some(Error::InvalidConfig(_))
    ));
}
