use colourgrad::{
    inspect, Evaluator, Image, Rgb, Sample, Trainer, TrainerConfig, TrainingRequest,
};
use std::{error::Error, fs, thread, time::Duration};
use tracing::info;

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt::init();

    // The small graph from the product rule example, dumped for Graphviz.
    let mut ev = Evaluator::<f64>::new();
    let a = ev.constant(-2.0);
    let b = ev.constant(3.0);
    let d = &a * &b;
    let e = &a + &b;
    let f = &d * &e;
    let value = ev.evaluate(&f)?;
    let slope = ev.evaluate_delta(&f, &a)?;
    info!(value, slope, "evaluated f = (a * b) * (a + b)");
    fs::write("graph.dot", inspect::to_dot(&f, &ev)?)?;
    info!("wrote graph.dot");

    let image = Image::from_fn(64, 48, |x, y| {
        Rgb::new(x as f64 / 63.0, y as f64 / 47.0, 0.5)
    });
    let samples = vec![
        Sample::new(Rgb::from_u8(255, 0, 0), Rgb::from_u8(0, 64, 255)),
        Sample::new(Rgb::from_u8(0, 255, 0), Rgb::from_u8(255, 200, 0)),
        Sample::new(Rgb::from_u8(0, 0, 0), Rgb::from_u8(20, 20, 40)),
        Sample::new(Rgb::from_u8(255, 255, 255), Rgb::from_u8(250, 240, 220)),
    ];
    let config = TrainerConfig::default()
        .with_learning_rate(0.02)
        .with_seed(7)
        .with_max_iterations(20_000);

    let trainer = Trainer::start(TrainingRequest {
        image,
        samples,
        config,
    })?;
    while !trainer.is_done() {
        thread::sleep(Duration::from_millis(500));
        info!(
            iterations = trainer.iterations(),
            last = trainer.last_error(),
            best = trainer.best_error(),
            "progress"
        );
    }

    let output = trainer.join()?;
    info!(best_error = output.best_error, "done");
    println!("{}", output.shader);
    Ok(())
}
