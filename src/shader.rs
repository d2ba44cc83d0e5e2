//! GLSL emission of a trained [`ColourNetwork`].
//!
//! The network computes `output = B * tanh(A * [input, 1]) + c`. `A` folds the
//! hidden biases into a fourth column so the whole hidden layer fits a
//! `mat4x4`; `B` is the `mat4x3` of output weights and `c` the output biases.

use crate::engine::Evaluator;
use crate::error::{Error, Result};
use crate::image::Rgb;
use crate::nn::{ColourNetwork, Layer, HIDDEN, INPUTS, OUTPUTS};
use std::fmt;

/// Learned affine–tanh–affine transform, matrices stored column-major as
/// GLSL expects: `a[column][row]`.
#[derive(Clone, Debug, PartialEq)]
pub struct ShaderTransform {
    pub a: [[f64; HIDDEN]; INPUTS + 1],
    pub b: [[f64; OUTPUTS]; HIDDEN],
    pub c: [f64; OUTPUTS],
}

fn read(evaluator: &Evaluator<f64>, layer: &Layer, unit: usize, slot: usize) -> Result<f64> {
    let parameter = layer.parameter(unit, slot).ok_or(Error::NotRegistered)?;
    evaluator.get_parameter(parameter)
}

impl ShaderTransform {
    pub fn from_network(network: &ColourNetwork) -> Result<Self> {
        let evaluator = network.evaluator();
        let hidden = network.hidden();
        let output = network.output();

        let mut a = [[0.0; HIDDEN]; INPUTS + 1];
        for (column, values) in a.iter_mut().enumerate() {
            for (row, value) in values.iter_mut().enumerate() {
                *value = read(evaluator, hidden, row, column)?;
            }
        }

        let mut b = [[0.0; OUTPUTS]; HIDDEN];
        for (column, values) in b.iter_mut().enumerate() {
            for (row, value) in values.iter_mut().enumerate() {
                *value = read(evaluator, output, row, column)?;
            }
        }

        let mut c = [0.0; OUTPUTS];
        for (row, value) in c.iter_mut().enumerate() {
            *value = read(evaluator, output, row, HIDDEN)?;
        }

        Ok(Self { a, b, c })
    }

    /// Evaluates the transform with plain arithmetic, no graph involved.
    /// The result is not clamped.
    pub fn apply(&self, colour: Rgb) -> Rgb {
        let [r, g, b] = colour.channels();
        let input = [r, g, b, 1.0];

        let mut hidden = [0.0; HIDDEN];
        for (column, x) in self.a.iter().zip(input) {
            for (h, w) in hidden.iter_mut().zip(column) {
                *h += w * x;
            }
        }

        let mut out = self.c;
        for (column, h) in self.b.iter().zip(hidden) {
            let h = h.tanh();
            for (o, w) in out.iter_mut().zip(column) {
                *o += w * h;
            }
        }
        Rgb::from_channels(out)
    }

    pub fn to_glsl(&self) -> String {
        self.to_string()
    }
}

// Debug formatting is the shortest round-trip form and keeps a trailing
// ".0" on integral values, so every literal reads as a GLSL float.
fn write_values<'a, I>(f: &mut fmt::Formatter, values: I) -> fmt::Result
where
    I: IntoIterator<Item = &'a f64>,
{
    for (i, value) in values.into_iter().enumerate() {
        if i != 0 {
            f.write_str(", ")?;
        }
        write!(f, "{:?}", value)?;
    }
    Ok(())
}

impl fmt::Display for ShaderTransform {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("mat4x4 a = mat4x4(")?;
        write_values(f, self.a.iter().flatten())?;
        f.write_str(");\n")?;

        f.write_str("mat4x3 b = mat4x3(")?;
        write_values(f, self.b.iter().flatten())?;
        f.write_str(");\n")?;

        f.write_str("vec3 c = vec3(")?;
        write_values(f, &self.c)?;
        f.write_str(");\n")?;

        f.write_str("col = b * tanh(a * vec4(col, 1.0)) + c;")
    }
}

/// Shader source for the network's current parameters.
pub fn glsl(network: &ColourNetwork) -> Result<String> {
    Ok(ShaderTransform::from_network(network)?.to_glsl())
}
