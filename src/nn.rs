use crate::config::Parallelism;
use crate::engine::{Checkpoint, Evaluator, Expr};
use crate::error::{Error, Result};
use crate::image::{Image, Rgb, Sample};
use num_traits::Float;
use rand::{distributions::Uniform, prelude::Distribution, Rng};
use rayon::prelude::*;
use std::sync::atomic::AtomicBool;

/// One fully connected stage. `parameters` is unit-major: the weights of
/// unit `i` for every input, then its bias.
#[derive(Clone, Debug)]
pub struct Layer {
    num_inputs: usize,
    parameters: Vec<Expr>,
    outputs: Vec<Expr>,
}

impl Layer {
    /// Registers `num_outputs * (inputs.len() + 1)` zeroed parameters and
    /// builds `bias + sum(input_j * weight_j)` per unit, wrapped in `tanh`
    /// unless this is the final layer.
    pub fn new<T>(
        evaluator: &mut Evaluator<T>,
        inputs: &[Expr],
        num_outputs: usize,
        final_layer: bool,
    ) -> Result<Self>
    where
        T: Float,
    {
        let num_weights = inputs.len() + 1; // plus bias
        let parameters: Vec<Expr> = (0..num_outputs * num_weights)
            .map(|_| evaluator.parameter())
            .collect();

        let mut outputs = Vec::with_capacity(num_outputs);
        for unit in parameters.chunks(num_weights) {
            let (weights, bias) = unit.split_at(inputs.len());
            let mut out = bias[0].clone();
            for (input, weight) in inputs.iter().zip(weights) {
                out = out.try_add(&input.try_mul(weight)?)?;
            }
            outputs.push(if final_layer { out } else { out.try_tanh()? });
        }

        Ok(Self {
            num_inputs: inputs.len(),
            parameters,
            outputs,
        })
    }

    pub fn parameters(&self) -> &[Expr] {
        &self.parameters
    }

    pub fn outputs(&self) -> &[Expr] {
        &self.outputs
    }

    pub fn num_inputs(&self) -> usize {
        self.num_inputs
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Weight `slot` of `unit`; `slot == num_inputs()` is the bias.
    pub fn parameter(&self, unit: usize, slot: usize) -> Option<&Expr> {
        if slot > self.num_inputs {
            return None;
        }
        self.parameters.get(unit * (self.num_inputs + 1) + slot)
    }
}

pub const INPUTS: usize = 3;
pub const HIDDEN: usize = 4;
pub const OUTPUTS: usize = 3;

/// The 3 -> 4 (tanh) -> 3 (linear) colour perceptron together with its
/// target variables and squared error.
#[derive(Clone)]
pub struct ColourNetwork {
    evaluator: Evaluator<f64>,
    inputs: Vec<Expr>,
    targets: Vec<Expr>,
    hidden: Layer,
    output: Layer,
    error: Expr,
}

impl ColourNetwork {
    pub fn new() -> Result<Self> {
        let mut evaluator = Evaluator::new();
        let inputs: Vec<Expr> = (0..INPUTS).map(|_| evaluator.parameter()).collect();

        let hidden = Layer::new(&mut evaluator, &inputs, HIDDEN, false)?;
        let output = Layer::new(&mut evaluator, hidden.outputs(), OUTPUTS, true)?;

        let mut targets = Vec::with_capacity(OUTPUTS);
        let mut error = Expr::empty();
        for out in output.outputs() {
            let target = evaluator.parameter();
            let diff = out.try_sub(&target)?;
            let squared = diff.try_mul(&diff)?;
            error = if error.is_empty() {
                squared
            } else {
                error.try_add(&squared)?
            };
            targets.push(target);
        }

        Ok(Self {
            evaluator,
            inputs,
            targets,
            hidden,
            output,
            error,
        })
    }

    /// Draws every weight and bias uniformly from `[-1, 1)`.
    pub fn randomize<R: Rng>(&mut self, rng: &mut R) -> Result<()> {
        let between = Uniform::from(-1.0..1.0);
        let trainable: Vec<Expr> = self.trainable().cloned().collect();
        for parameter in &trainable {
            self.evaluator
                .set_parameter(parameter, between.sample(rng))?;
        }
        Ok(())
    }

    /// Hidden-layer parameters followed by output-layer parameters.
    pub fn trainable(&self) -> impl Iterator<Item = &Expr> {
        self.hidden
            .parameters()
            .iter()
            .chain(self.output.parameters())
    }

    pub fn trainable_count(&self) -> usize {
        self.hidden.parameters().len() + self.output.parameters().len()
    }

    pub fn set_input(&mut self, colour: Rgb) -> Result<()> {
        for (input, value) in self.inputs.iter().zip(colour.channels()) {
            self.evaluator.set_parameter(input, value)?;
        }
        Ok(())
    }

    pub fn load_sample(&mut self, sample: &Sample) -> Result<()> {
        self.set_input(sample.source)?;
        for (target, value) in self.targets.iter().zip(sample.target.channels()) {
            self.evaluator.set_parameter(target, value)?;
        }
        Ok(())
    }

    /// Summed squared error of the loaded sample.
    pub fn error(&mut self) -> Result<f64> {
        self.evaluator.evaluate(&self.error)
    }

    /// d(error)/d(p) for every trainable parameter, in [`trainable`] order.
    /// Reads the values cached by the last [`ColourNetwork::error`].
    ///
    /// [`trainable`]: ColourNetwork::trainable
    pub fn gradients(&self, parallelism: Parallelism) -> Result<Vec<f64>> {
        let trainable: Vec<&Expr> = self.trainable().collect();
        let delta = |parameter: &&Expr| self.evaluator.evaluate_delta(&self.error, parameter);
        match parallelism {
            Parallelism::Sequential => trainable.iter().map(delta).collect(),
            Parallelism::Parallel => trainable.par_iter().map(delta).collect(),
        }
    }

    /// `p -= gradient * error * learning_rate` for every trainable parameter.
    pub fn apply_gradients(
        &mut self,
        gradients: &[f64],
        error: f64,
        learning_rate: f64,
    ) -> Result<()> {
        if gradients.len() != self.trainable_count() {
            return Err(Error::InvalidConfig(format!(
                "expected {} gradients, got {}",
                self.trainable_count(),
                gradients.len()
            )));
        }
        let trainable: Vec<Expr> = self.trainable().cloned().collect();
        for (parameter, gradient) in trainable.iter().zip(gradients) {
            let current = self.evaluator.get_parameter(parameter)?;
            self.evaluator
                .set_parameter(parameter, current - gradient * error * learning_rate)?;
        }
        Ok(())
    }

    /// Runs one colour through the network.
    pub fn predict(&mut self, colour: Rgb) -> Result<Rgb> {
        self.set_input(colour)?;
        // The error reaches every output unit, so one pass caches all three.
        self.evaluator.evaluate(&self.error)?;
        let mut channels = [0.0; OUTPUTS];
        for (channel, out) in channels.iter_mut().zip(self.output.outputs()) {
            *channel = self.evaluator.value(out)?;
        }
        Ok(Rgb::from_channels(channels))
    }

    /// Applies the network to every pixel, clamping into `[0, 1]`. Each row
    /// works on its own copy of the value table.
    pub fn transform(
        &self,
        image: &Image,
        abort: &AtomicBool,
        parallelism: Parallelism,
    ) -> Result<Image> {
        image.map_rows(parallelism, abort, self, |network, colour| {
            network.predict(colour).map(|c| c.clamped())
        })
    }

    pub fn checkpoint(&self) -> Checkpoint<f64> {
        self.evaluator.checkpoint()
    }

    pub fn restore(&mut self, checkpoint: &Checkpoint<f64>) {
        self.evaluator.restore(checkpoint);
    }

    pub fn evaluator(&self) -> &Evaluator<f64> {
        &self.evaluator
    }

    pub fn evaluator_mut(&mut self) -> &mut Evaluator<f64> {
        &mut self.evaluator
    }

    pub fn hidden(&self) -> &Layer {
        &self.hidden
    }

    pub fn output(&self) -> &Layer {
        &self.output
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::{rngs::StdRng, SeedableRng};

    const EPS: f64 = 1e-12;

    #[test]
    fn layer_shape_and_layout() {
        let mut ev = Evaluator::<f64>::new();
        let inputs: Vec<Expr> = (0..2).map(|_| ev.parameter()).collect();
        let layer = Layer::new(&mut ev, &inputs, 3, false).unwrap();

        assert_eq!(layer.parameters().len(), 9);
        assert_eq!(layer.num_outputs(), 3);
        assert!(layer.parameter(1, 2).unwrap().ptr_eq(&layer.parameters()[5]));
        assert!(layer.parameter(0, 3).is_none());
        assert_eq!(ev.variable_count(), 11);
    }

    #[test]
    fn layer_outputs_follow_weights() {
        let mut ev = Evaluator::<f64>::new();
        let x0 = ev.constant(1.0);
        let x1 = ev.constant(2.0);
        let inputs = [x0, x1];
        let linear = Layer::new(&mut ev, &inputs, 1, true).unwrap();
        let squashed = Layer::new(&mut ev, &inputs, 1, false).unwrap();

        // Zero-initialised until someone randomizes them.
        assert_eq!(ev.evaluate(&linear.outputs()[0]).unwrap(), 0.0);

        for layer in [&linear, &squashed] {
            ev.set_parameter(layer.parameter(0, 0).unwrap(), 0.5).unwrap();
            ev.set_parameter(layer.parameter(0, 1).unwrap(), -1.0).unwrap();
            ev.set_parameter(layer.parameter(0, 2).unwrap(), 0.25).unwrap();
        }

        assert!((ev.evaluate(&linear.outputs()[0]).unwrap() + 1.25).abs() < EPS);
        let expected = (-1.25f64).tanh();
        assert!((ev.evaluate(&squashed.outputs()[0]).unwrap() - expected).abs() < EPS);
    }

    #[test]
    fn layer_rejects_empty_inputs() {
        let mut ev = Evaluator::<f64>::new();
        let inputs = [Expr::empty()];
        assert_eq!(
            Layer::new(&mut ev, &inputs, 2, true).unwrap_err(),
            Error::EmptyExpression
        );
    }

    #[test]
    fn network_topology() {
        let network = ColourNetwork::new().unwrap();
        assert_eq!(network.trainable_count(), HIDDEN * (INPUTS + 1) + OUTPUTS * (HIDDEN + 1));
        assert_eq!(network.hidden().num_inputs(), INPUTS);
        assert_eq!(network.output().num_inputs(), HIDDEN);
        // inputs + targets + trainable
        assert_eq!(network.evaluator().variable_count(), 3 + 3 + 31);
    }

    #[test]
    fn error_matches_manual_sum() {
        let mut network = ColourNetwork::new().unwrap();
        network.randomize(&mut StdRng::seed_from_u64(11)).unwrap();
        let sample = Sample::new(Rgb::new(0.2, 0.4, 0.6), Rgb::new(0.9, 0.1, 0.3));

        let prediction = network.predict(sample.source).unwrap();
        network.load_sample(&sample).unwrap();
        let error = network.error().unwrap();

        let manual: f64 = prediction
            .channels()
            .iter()
            .zip(sample.target.channels())
            .map(|(p, t)| (p - t) * (p - t))
            .sum();
        assert!((error - manual).abs() < EPS);
    }

    #[test]
    fn gradients_match_finite_differences() {
        let mut network = ColourNetwork::new().unwrap();
        network.randomize(&mut StdRng::seed_from_u64(5)).unwrap();
        network
            .load_sample(&Sample::new(Rgb::new(0.3, 0.7, 0.1), Rgb::new(0.6, 0.2, 0.8)))
            .unwrap();
        network.error().unwrap();
        let gradients = network.gradients(Parallelism::Sequential).unwrap();
        assert_eq!(gradients, network.gradients(Parallelism::Parallel).unwrap());

        let h = 1e-6;
        let trainable: Vec<Expr> = network.trainable().cloned().collect();
        for (parameter, analytic) in trainable.iter().zip(&gradients) {
            let base = network.evaluator().get_parameter(parameter).unwrap();
            network.evaluator_mut().set_parameter(parameter, base + h).unwrap();
            let up = network.error().unwrap();
            network.evaluator_mut().set_parameter(parameter, base - h).unwrap();
            let down = network.error().unwrap();
            network.evaluator_mut().set_parameter(parameter, base).unwrap();

            let numeric = (up - down) / (2.0 * h);
            assert!((numeric - analytic).abs() < 1e-6, "{numeric} vs {analytic}");
        }
    }

    #[test]
    fn update_scales_with_error_and_rate() {
        let mut network = ColourNetwork::new().unwrap();
        let gradients = vec![1.0; network.trainable_count()];
        network.apply_gradients(&gradients, 2.0, 0.25).unwrap();
        for parameter in network.trainable() {
            assert_eq!(network.evaluator().get_parameter(parameter).unwrap(), -0.5);
        }
        assert!(network.apply_gradients(&[1.0], 1.0, 1.0).is_err());
    }

    #[test]
    fn parallel_transform_is_bit_identical() {
        let mut network = ColourNetwork::new().unwrap();
        network.randomize(&mut StdRng::seed_from_u64(42)).unwrap();
        let image = Image::from_fn(23, 17, |x, y| {
            Rgb::new(x as f64 / 22.0, y as f64 / 16.0, ((x * y) % 7) as f64 / 6.0)
        });
        let abort = AtomicBool::new(false);

        let sequential = network
            .transform(&image, &abort, Parallelism::Sequential)
            .unwrap();
        let parallel = network
            .transform(&image, &abort, Parallelism::Parallel)
            .unwrap();

        assert_eq!(sequential, parallel);
        assert!(sequential
            .pixels()
            .iter()
            .flat_map(|c| c.channels())
            .all(|v| (0.0..=1.0).contains(&v)));
    }
}
