//! Entropy Sub-model
//!
//! This module implements the scale-hyperprior entropy model used by every frame
//! and motion codec, with ANS coding provided by the `constriction` library.
//!
//! ## Overview
//!
//! ```text
//!   x --gain--> y --|.|, avg-pool--> z --EntropyBottleneck--> hyperprior stream
//!                                    |
//!                                  z_hat --hyper synthesis--> scales
//!                                                               |
//!   y --GaussianConditional(0, scale_table[idx(scales)])--> prior stream
//! ```
//!
//! Two entropy models take part:
//!
//! - **EntropyBottleneck**: factorized per-channel prior for the side information `z`
//! - **GaussianConditional**: zero-mean Gaussian for the main latent `y`, its scales
//!   snapped to a calibrated scale table
//!
//! ## Calibration
//!
//! Both models hold tables that are only built by [`HyperpriorCompressor::update`].
//! Until then `compress`/`decompress` refuse to run; the in-memory
//! [`HyperpriorCompressor::estimate`] path works at any time.

use crate::bitstream::{
    frame_stream, stream_symbols, unframe_stream, BitstreamRecord, LatentShape, MAX_STREAM_SYMBOLS,
};
use crate::error::{Error, Result};
use crate::params::{prefixed, ParamMut, ParamRef, Parameterized};
use crate::tensor::{avg_pool2, upsample_nearest_to};
use constriction::stream::model::DefaultLeakyQuantizer;
use constriction::stream::stack::DefaultAnsCoder;
use constriction::stream::{Decode, Encode};
use ndarray::{Array1, Array2, Array4, Axis};
use probability::distribution::Gaussian;
use tracing::{debug, trace, warn};

// -------------------------------------------------------------------------
// Constants
// -------------------------------------------------------------------------

/// Smallest value of the default scale table
pub const SCALES_MIN: f32 = 0.11;

/// Largest value of the default scale table
pub const SCALES_MAX: f32 = 256.0;

/// Number of entries in the default scale table
pub const SCALES_LEVELS: usize = 64;

/// Minimum value for latent symbols
pub const MIN_SYMBOL: i32 = -128;

/// Maximum value for latent symbols
pub const MAX_SYMBOL: i32 = 127;

/// Minimum scale handed to the ANS model
pub const MIN_SCALE: f64 = 0.01;

/// Maximum scale handed to the ANS model
pub const MAX_SCALE: f64 = 256.0;

/// Default per-channel gain applied before quantization
pub const DEFAULT_QUANT_GAIN: f32 = 16.0;

/// Initial half-width of the bottleneck quantiles
pub const DEFAULT_INIT_SCALE: f32 = 10.0;

/// The quantile range spans this many standard deviations on either side
const QUANTILE_SIGMAS: f64 = 3.0;

const GAIN_EPSILON: f32 = 1e-6;

// -------------------------------------------------------------------------
// Helper Functions
// -------------------------------------------------------------------------

/// Logarithmically spaced scale table with `levels` entries over `[min, max]`
pub fn scale_table(min: f32, max: f32, levels: usize) -> Vec<f32> {
    match levels {
        0 => Vec::new(),
        1 => vec![min],
        _ => {
            let log_min = (min as f64).ln();
            let log_max = (max as f64).ln();
            (0..levels)
                .map(|i| {
                    let t = i as f64 / (levels - 1) as f64;
                    (log_min + t * (log_max - log_min)).exp() as f32
                })
                .collect()
        }
    }
}

/// The default 64-entry table over `[0.11, 256]`
pub fn default_scale_table() -> Vec<f32> {
    scale_table(SCALES_MIN, SCALES_MAX, SCALES_LEVELS)
}

/// Round to the nearest integer symbol inside the coder's range
pub fn quantize_symbol(value: f32) -> i32 {
    (value.round() as i32).clamp(MIN_SYMBOL, MAX_SYMBOL)
}

/// Estimate the number of bits required to encode symbols given Gaussian parameters
///
/// Uses the information-theoretic formula:
///   bits = -log2(P(symbol | mean, scale))
/// where `P` is the Gaussian mass of the unit bin around the symbol.
pub fn estimate_bits(symbols: &[i32], means: &[f32], scales: &[f32]) -> f64 {
    if symbols.len() != means.len() || symbols.len() != scales.len() {
        return f64::INFINITY;
    }

    let mut total_bits = 0.0f64;

    for ((&symbol, &mean), &scale) in symbols.iter().zip(means.iter()).zip(scales.iter()) {
        let scale_clamped = (scale as f64).clamp(MIN_SCALE, MAX_SCALE);
        let mean_f64 = mean as f64;

        let x = symbol as f64;
        let upper = normal_cdf((x + 0.5 - mean_f64) / scale_clamped);
        let lower = normal_cdf((x - 0.5 - mean_f64) / scale_clamped);

        let prob = (upper - lower).max(1e-10);
        total_bits += -prob.log2();
    }

    total_bits
}

/// Standard normal CDF using the error function approximation
fn normal_cdf(x: f64) -> f64 {
    0.5 * (1.0 + erf(x / std::f64::consts::SQRT_2))
}

/// Error function approximation (Abramowitz and Stegun 7.1.26)
fn erf(x: f64) -> f64 {
    let sign = if x < 0.0 { -1.0 } else { 1.0 };
    let x = x.abs();

    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let t = 1.0 / (1.0 + P * x);
    let y = 1.0 - (((((A5 * t + A4) * t) + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    sign * y
}

/// ANS-encode symbols, each under its own `(mean, scale)` Gaussian
fn ans_encode(symbols: &[i32], params: &[(f64, f64)]) -> Result<Vec<u32>> {
    if symbols.len() != params.len() {
        return Err(Error::encoding_failed(format!(
            "Length mismatch: symbols={}, params={}",
            symbols.len(),
            params.len()
        )));
    }

    let mut coder = DefaultAnsCoder::new();
    let quantizer = DefaultLeakyQuantizer::new(MIN_SYMBOL..=MAX_SYMBOL);

    // ANS is LIFO: encode in reverse so decoding runs forward
    for (&symbol, &(mean, scale)) in symbols.iter().zip(params.iter()).rev() {
        let gaussian = Gaussian::new(mean, scale.clamp(MIN_SCALE, MAX_SCALE));
        let model = quantizer.quantize(gaussian);

        coder
            .encode_symbol(symbol, model)
            .map_err(|e| Error::encoding_failed(format!("ANS encode failed: {:?}", e)))?;
    }

    coder
        .into_compressed()
        .map_err(|e| Error::encoding_failed(format!("Failed to get compressed data: {:?}", e)))
}

/// ANS-decode one symbol per `(mean, scale)` pair
fn ans_decode(words: Vec<u32>, params: &[(f64, f64)]) -> Result<Vec<i32>> {
    if params.is_empty() {
        return Ok(Vec::new());
    }

    let mut coder = DefaultAnsCoder::from_compressed(words)
        .map_err(|_| Error::decoding_failed("Failed to initialize decoder: invalid final word"))?;
    let quantizer = DefaultLeakyQuantizer::new(MIN_SYMBOL..=MAX_SYMBOL);

    let mut symbols = Vec::with_capacity(params.len());
    for &(mean, scale) in params {
        let gaussian = Gaussian::new(mean, scale.clamp(MIN_SCALE, MAX_SCALE));
        let model = quantizer.quantize(gaussian);

        let symbol = coder
            .decode_symbol(model)
            .map_err(|e| Error::decoding_failed(format!("ANS decode failed: {:?}", e)))?;
        symbols.push(symbol);
    }

    Ok(symbols)
}

fn check_stream_symbols(stream: &str, data: &[u8], expected: usize) -> Result<()> {
    let declared = stream_symbols(data)?;
    if declared != expected {
        return Err(Error::decoding_failed(format!(
            "{} stream holds {} symbols but the record shape implies {}",
            stream, declared, expected
        )));
    }
    Ok(())
}

fn safe_gain(g: f32) -> f32 {
    if g.abs() < GAIN_EPSILON {
        GAIN_EPSILON.copysign(g)
    } else {
        g
    }
}

// -------------------------------------------------------------------------
// EntropyBottleneck
// -------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct ChannelModel {
    median: f32,
    scale: f64,
}

/// Factorized prior for the hyper-latent `z`
///
/// Each channel is described by three learned quantiles (lower, median, upper).
/// Calibration turns them into a per-channel coding model centred on the median.
#[derive(Debug, Clone)]
pub struct EntropyBottleneck {
    /// `[C, 3]`: lower, median, upper
    quantiles: Array2<f32>,
    tables: Option<Vec<ChannelModel>>,
}

impl EntropyBottleneck {
    /// Create an uncalibrated bottleneck with `channels` channels
    pub fn new(channels: usize) -> Self {
        let mut quantiles = Array2::zeros((channels, 3));
        for mut row in quantiles.rows_mut() {
            row[0] = -DEFAULT_INIT_SCALE;
            row[2] = DEFAULT_INIT_SCALE;
        }
        Self {
            quantiles,
            tables: None,
        }
    }

    /// Number of channels
    pub fn channels(&self) -> usize {
        self.quantiles.nrows()
    }

    /// Whether coding tables exist
    pub fn is_calibrated(&self) -> bool {
        self.tables.is_some()
    }

    /// Learned per-channel medians
    pub fn medians(&self) -> Array1<f32> {
        self.quantiles.column(1).to_owned()
    }

    /// Rebuild the coding tables
    ///
    /// Returns `false` without touching anything when tables already exist and
    /// `force` is not set.
    pub fn update(&mut self, force: bool, update_quantiles: bool) -> bool {
        if self.tables.is_some() && !force {
            return false;
        }
        if update_quantiles {
            self.recentre_quantiles();
        }
        self.tables = Some(self.models_from_quantiles());
        true
    }

    fn recentre_quantiles(&mut self) {
        for mut row in self.quantiles.rows_mut() {
            let half = (row[2] - row[0]).abs() / 2.0;
            row[0] = row[1] - half;
            row[2] = row[1] + half;
        }
    }

    fn models_from_quantiles(&self) -> Vec<ChannelModel> {
        self.quantiles
            .rows()
            .into_iter()
            .map(|row| {
                let spread = (row[2] - row[0]).abs() as f64;
                ChannelModel {
                    median: row[1],
                    scale: (spread / (2.0 * QUANTILE_SIGMAS)).clamp(MIN_SCALE, MAX_SCALE),
                }
            })
            .collect()
    }

    fn calibrated_models(&self) -> Result<&[ChannelModel]> {
        self.tables
            .as_deref()
            .ok_or_else(|| Error::not_calibrated("EntropyBottleneck"))
    }

    fn quantize(&self, z: &Array4<f32>, models: &[ChannelModel]) -> Result<(Vec<i32>, Array4<f32>)> {
        if z.dim().1 != models.len() {
            return Err(Error::shape_mismatch(
                "EntropyBottleneck",
                &[z.dim().0, models.len(), z.dim().2, z.dim().3],
                z.shape(),
            ));
        }
        let mut symbols = Vec::with_capacity(z.len());
        let mut z_hat = Array4::zeros(z.dim());
        for ((b, c, y, x), &value) in z.indexed_iter() {
            let median = models[c].median;
            let symbol = quantize_symbol(value - median);
            symbols.push(symbol);
            z_hat[[b, c, y, x]] = symbol as f32 + median;
        }
        Ok((symbols, z_hat))
    }

    fn coding_params(models: &[ChannelModel], dim: (usize, usize, usize, usize)) -> Vec<(f64, f64)> {
        let (b, c, h, w) = dim;
        let mut params = Vec::with_capacity(b * c * h * w);
        for _ in 0..b {
            for model in models.iter().take(c) {
                params.extend(std::iter::repeat((0.0, model.scale)).take(h * w));
            }
        }
        params
    }

    /// Quantize and estimate the cost of `z` without serializing
    pub fn estimate(&self, z: &Array4<f32>) -> Result<(Array4<f32>, f64)> {
        let models = self.models_from_quantiles();
        let (symbols, z_hat) = self.quantize(z, &models)?;
        let scales: Vec<f32> = z
            .indexed_iter()
            .map(|((_, c, _, _), _)| models[c].scale as f32)
            .collect();
        let means = vec![0.0f32; symbols.len()];
        Ok((z_hat, estimate_bits(&symbols, &means, &scales)))
    }

    /// Encode `z`; returns the framed stream and the dequantized `z_hat`
    pub fn compress(&self, z: &Array4<f32>) -> Result<(Vec<u8>, Array4<f32>)> {
        let models = self.calibrated_models()?;
        let (symbols, z_hat) = self.quantize(z, models)?;
        let params = Self::coding_params(models, z.dim());
        let words = ans_encode(&symbols, &params)?;
        Ok((frame_stream(symbols.len(), &words), z_hat))
    }

    /// Decode a stream produced by [`EntropyBottleneck::compress`]
    pub fn decompress(&self, data: &[u8], dim: (usize, usize, usize, usize)) -> Result<Array4<f32>> {
        let models = self.calibrated_models()?;
        let (b, c, h, w) = dim;
        if c != models.len() {
            return Err(Error::decoding_failed(format!(
                "hyperprior has {} channels, model expects {}",
                c,
                models.len()
            )));
        }

        let params = Self::coding_params(models, dim);
        let words = unframe_stream(data, params.len())?;
        let symbols = ans_decode(words, &params)?;

        let mut values = Vec::with_capacity(symbols.len());
        let mut idx = 0;
        for _ in 0..b {
            for model in models.iter() {
                for _ in 0..h * w {
                    values.push(symbols[idx] as f32 + model.median);
                    idx += 1;
                }
            }
        }

        Array4::from_shape_vec(dim, values)
            .map_err(|e| Error::decoding_failed(format!("hyperprior reshape failed: {}", e)))
    }
}

// -------------------------------------------------------------------------
// GaussianConditional
// -------------------------------------------------------------------------

/// Zero-mean Gaussian conditional model for the main latent
#[derive(Debug, Clone)]
pub struct GaussianConditional {
    scale_bound: f32,
    scale_table: Option<Vec<f32>>,
}

impl GaussianConditional {
    /// Create an uncalibrated model whose scales never drop below `scale_bound`
    pub fn new(scale_bound: f32) -> Self {
        Self {
            scale_bound,
            scale_table: None,
        }
    }

    /// Whether a scale table has been installed
    pub fn is_calibrated(&self) -> bool {
        self.scale_table.is_some()
    }

    /// The installed scale table
    pub fn scale_table(&self) -> Option<&[f32]> {
        self.scale_table.as_deref()
    }

    /// Install a scale table
    ///
    /// Returns `false` when a table is already installed and `force` is not set,
    /// or when `table` holds no usable (finite, positive) scale.
    pub fn update_scale_table(&mut self, table: &[f32], force: bool) -> bool {
        if self.scale_table.is_some() && !force {
            return false;
        }
        let mut table: Vec<f32> = table
            .iter()
            .copied()
            .filter(|s| s.is_finite() && *s > 0.0)
            .collect();
        if table.is_empty() {
            warn!("ignoring scale table without usable entries");
            return false;
        }
        table.sort_by(|a, b| a.total_cmp(b));
        table.dedup();
        self.scale_table = Some(table);
        true
    }

    /// Clamp a predicted scale to the lower bound
    pub fn lower_bound(&self, scale: f32) -> f32 {
        scale.max(self.scale_bound)
    }

    /// Index of the first table entry not below `scale`
    pub fn find_scale_index(table: &[f32], scale: f32) -> usize {
        table
            .partition_point(|&s| s < scale)
            .min(table.len().saturating_sub(1))
    }

    fn calibrated_table(&self) -> Result<&[f32]> {
        self.scale_table
            .as_deref()
            .ok_or_else(|| Error::not_calibrated("GaussianConditional"))
    }

    fn coding_params(table: &[f32], scales: &Array4<f32>) -> Vec<(f64, f64)> {
        scales
            .iter()
            .map(|&s| (0.0, table[Self::find_scale_index(table, s)] as f64))
            .collect()
    }

    /// Quantize `y` and estimate its cost under the unquantized `scales`
    pub fn estimate(&self, y: &Array4<f32>, scales: &Array4<f32>) -> (Array4<f32>, f64) {
        let symbols: Vec<i32> = y.iter().map(|&v| quantize_symbol(v)).collect();
        let y_hat = y.mapv(|v| quantize_symbol(v) as f32);
        let means = vec![0.0f32; symbols.len()];
        let scales: Vec<f32> = scales.iter().copied().collect();
        (y_hat, estimate_bits(&symbols, &means, &scales))
    }

    /// Encode `y` under the table entries selected by `scales`
    pub fn compress(&self, y: &Array4<f32>, scales: &Array4<f32>) -> Result<Vec<u8>> {
        let table = self.calibrated_table()?;
        if y.shape() != scales.shape() {
            return Err(Error::shape_mismatch("GaussianConditional", y.shape(), scales.shape()));
        }
        let symbols: Vec<i32> = y.iter().map(|&v| quantize_symbol(v)).collect();
        let params = Self::coding_params(table, scales);
        let words = ans_encode(&symbols, &params)?;
        Ok(frame_stream(symbols.len(), &words))
    }

    /// Decode a stream produced by [`GaussianConditional::compress`]
    pub fn decompress(&self, data: &[u8], scales: &Array4<f32>) -> Result<Array4<f32>> {
        let table = self.calibrated_table()?;
        let params = Self::coding_params(table, scales);
        let words = unframe_stream(data, params.len())?;
        let symbols = ans_decode(words, &params)?;
        let values: Vec<f32> = symbols.into_iter().map(|s| s as f32).collect();
        Array4::from_shape_vec(scales.dim(), values)
            .map_err(|e| Error::decoding_failed(format!("latent reshape failed: {}", e)))
    }
}

impl Default for GaussianConditional {
    fn default() -> Self {
        Self::new(SCALES_MIN)
    }
}

// -------------------------------------------------------------------------
// HyperpriorCompressor
// -------------------------------------------------------------------------

/// In-memory rate estimate of one tensor
#[derive(Debug, Clone)]
pub struct RateEstimate {
    /// Tensor after quantization and synthesis
    pub reconstruction: Array4<f32>,
    /// Estimated bits of the main latent
    pub prior_bits: f64,
    /// Estimated bits of the side information
    pub hyperprior_bits: f64,
}

impl RateEstimate {
    /// Sum of both bit terms
    pub fn total_bits(&self) -> f64 {
        self.prior_bits + self.hyperprior_bits
    }
}

/// Scale-hyperprior entropy sub-model for one `[B, C, H, W]` tensor stream
#[derive(Debug, Clone)]
pub struct HyperpriorCompressor {
    gain: Array1<f32>,
    hyper_gain: Array1<f32>,
    hyper_bias: Array1<f32>,
    entropy_bottleneck: EntropyBottleneck,
    gaussian_conditional: GaussianConditional,
}

impl HyperpriorCompressor {
    /// Create a compressor for `channels` channels with the default gain
    pub fn new(channels: usize) -> Self {
        Self::with_gain(channels, DEFAULT_QUANT_GAIN)
    }

    /// Create a compressor with a custom initial gain
    pub fn with_gain(channels: usize, gain: f32) -> Self {
        Self {
            gain: Array1::from_elem(channels, gain),
            hyper_gain: Array1::ones(channels),
            hyper_bias: Array1::from_elem(channels, 0.5),
            entropy_bottleneck: EntropyBottleneck::new(channels),
            gaussian_conditional: GaussianConditional::default(),
        }
    }

    /// Number of channels this compressor codes
    pub fn channels(&self) -> usize {
        self.gain.len()
    }

    /// Both entropy models have tables
    pub fn is_calibrated(&self) -> bool {
        self.entropy_bottleneck.is_calibrated() && self.gaussian_conditional.is_calibrated()
    }

    /// The scale table of the Gaussian conditional, once calibrated
    pub fn scale_table(&self) -> Option<&[f32]> {
        self.gaussian_conditional.scale_table()
    }

    fn check_channels(&self, context: &str, x: &Array4<f32>) -> Result<()> {
        let (b, c, h, w) = x.dim();
        if c != self.channels() {
            return Err(Error::shape_mismatch(context, &[b, self.channels(), h, w], x.shape()));
        }
        Ok(())
    }

    fn analysis(&self, x: &Array4<f32>) -> Array4<f32> {
        let mut y = x.clone();
        for (c, mut plane) in y.axis_iter_mut(Axis(1)).enumerate() {
            plane *= self.gain[c];
        }
        y
    }

    fn synthesis(&self, y_hat: Array4<f32>) -> Array4<f32> {
        let mut x = y_hat;
        for (c, mut plane) in x.axis_iter_mut(Axis(1)).enumerate() {
            plane /= safe_gain(self.gain[c]);
        }
        x
    }

    fn hyper_analysis(y: &Array4<f32>) -> Array4<f32> {
        avg_pool2(&y.mapv(f32::abs))
    }

    fn hyper_synthesis(&self, z_hat: &Array4<f32>, height: usize, width: usize) -> Array4<f32> {
        let mut scales = upsample_nearest_to(z_hat, height, width);
        for ((_, c, _, _), value) in scales.indexed_iter_mut() {
            *value = self
                .gaussian_conditional
                .lower_bound(value.abs() * self.hyper_gain[c] + self.hyper_bias[c]);
        }
        scales
    }

    /// In-memory pass: quantize, reconstruct and estimate the rate
    pub fn estimate(&self, x: &Array4<f32>) -> Result<RateEstimate> {
        self.check_channels("HyperpriorCompressor::estimate", x)?;
        let (_, _, h, w) = x.dim();

        let y = self.analysis(x);
        let z = Self::hyper_analysis(&y);
        let (z_hat, hyperprior_bits) = self.entropy_bottleneck.estimate(&z)?;
        let scales = self.hyper_synthesis(&z_hat, h, w);
        let (y_hat, prior_bits) = self.gaussian_conditional.estimate(&y, &scales);

        Ok(RateEstimate {
            reconstruction: self.synthesis(y_hat),
            prior_bits,
            hyperprior_bits,
        })
    }

    /// Serialize a tensor
    pub fn compress(&self, x: &Array4<f32>) -> Result<BitstreamRecord> {
        if x.len() > MAX_STREAM_SYMBOLS {
            return Err(Error::encoding_failed(format!(
                "tensor of {} elements exceeds {} symbols per stream",
                x.len(),
                MAX_STREAM_SYMBOLS
            )));
        }
        if !self.entropy_bottleneck.is_calibrated() {
            return Err(Error::not_calibrated("EntropyBottleneck"));
        }
        if !self.gaussian_conditional.is_calibrated() {
            return Err(Error::not_calibrated("GaussianConditional"));
        }
        self.check_channels("HyperpriorCompressor::compress", x)?;
        let (_, _, h, w) = x.dim();

        let y = self.analysis(x);
        let z = Self::hyper_analysis(&y);
        let (hyperprior, z_hat) = self.entropy_bottleneck.compress(&z)?;
        let scales = self.hyper_synthesis(&z_hat, h, w);
        let prior = self.gaussian_conditional.compress(&y, &scales)?;

        trace!(
            prior_bytes = prior.len(),
            hyperprior_bytes = hyperprior.len(),
            "tensor compressed"
        );
        Ok(BitstreamRecord::new(prior, hyperprior, LatentShape::of(x)))
    }

    /// Rebuild a tensor from a record produced by [`HyperpriorCompressor::compress`]
    pub fn decompress(&self, record: &BitstreamRecord) -> Result<Array4<f32>> {
        if !self.entropy_bottleneck.is_calibrated() {
            return Err(Error::not_calibrated("EntropyBottleneck"));
        }
        if !self.gaussian_conditional.is_calibrated() {
            return Err(Error::not_calibrated("GaussianConditional"));
        }
        if record.is_sentinel() {
            return Err(Error::decoding_failed("cannot decode an empty record"));
        }

        let shape = record.shape;
        if shape.channels != self.channels() {
            return Err(Error::decoding_failed(format!(
                "record has {} channels, compressor codes {}",
                shape.channels,
                self.channels()
            )));
        }
        let elements = match shape.num_elements() {
            None => {
                return Err(Error::decoding_failed(format!(
                    "record shape {:?} overflows the element count",
                    shape.to_vec()
                )))
            }
            Some(0) => {
                return Err(Error::decoding_failed(format!(
                    "record shape {:?} has no elements",
                    shape.to_vec()
                )))
            }
            Some(n) if n > MAX_STREAM_SYMBOLS => {
                return Err(Error::decoding_failed(format!(
                    "record shape {:?} exceeds {} symbols",
                    shape.to_vec(),
                    MAX_STREAM_SYMBOLS
                )))
            }
            Some(n) => n,
        };
        let z_shape = shape.pooled();
        let z_elements = z_shape.num_elements().unwrap_or(elements);

        // Header counts must agree with the shape before anything is sized from it
        check_stream_symbols("hyperprior", &record.hyperprior, z_elements)?;
        check_stream_symbols("prior", &record.prior, elements)?;

        let z_hat = self.entropy_bottleneck.decompress(&record.hyperprior, z_shape.dim())?;
        let scales = self.hyper_synthesis(&z_hat, shape.height, shape.width);
        let y_hat = self.gaussian_conditional.decompress(&record.prior, &scales)?;

        Ok(self.synthesis(y_hat))
    }

    /// Recompute calibration tables
    ///
    /// `scale_table` defaults to [`default_scale_table`]. Returns whether any table
    /// changed.
    pub fn update(&mut self, scale_table: Option<&[f32]>, force: bool, update_quantiles: bool) -> bool {
        let default_table;
        let table = match scale_table {
            Some(table) => table,
            None => {
                default_table = default_scale_table();
                &default_table
            }
        };

        let mut updated = self.entropy_bottleneck.update(force, update_quantiles);
        updated |= self.gaussian_conditional.update_scale_table(table, force);
        debug!(updated, force, "entropy model calibration");
        updated
    }
}

impl Parameterized for HyperpriorCompressor {
    fn named_parameters(&self) -> Vec<(String, ParamRef<'_>)> {
        let mut params = vec![
            ("gain".to_string(), ParamRef::Vector(&self.gain)),
            ("hyper_synthesis.gain".to_string(), ParamRef::Vector(&self.hyper_gain)),
            ("hyper_synthesis.bias".to_string(), ParamRef::Vector(&self.hyper_bias)),
        ];
        params.extend(prefixed(
            "entropy_bottleneck",
            vec![(
                "quantiles".to_string(),
                ParamRef::Matrix(&self.entropy_bottleneck.quantiles),
            )],
        ));
        params
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ParamMut<'_>)> {
        let mut params = vec![
            ("gain".to_string(), ParamMut::Vector(&mut self.gain)),
            ("hyper_synthesis.gain".to_string(), ParamMut::Vector(&mut self.hyper_gain)),
            ("hyper_synthesis.bias".to_string(), ParamMut::Vector(&mut self.hyper_bias)),
        ];
        params.extend(prefixed(
            "entropy_bottleneck",
            vec![(
                "quantiles".to_string(),
                ParamMut::Matrix(&mut self.entropy_bottleneck.quantiles),
            )],
        ));
        params
    }
}

/// Components that own entropy sub-models
pub trait EntropyModels {
    /// Every entropy sub-model reachable from this component
    fn entropy_models(&self) -> Vec<&HyperpriorCompressor>;

    /// Mutable access to the same sub-models
    fn entropy_models_mut(&mut self) -> Vec<&mut HyperpriorCompressor>;

    /// Calibrate every sub-model; true if any table changed
    fn update_entropy_models(
        &mut self,
        scale_table: Option<&[f32]>,
        force: bool,
        update_quantiles: bool,
    ) -> bool {
        let mut updated = false;
        for model in self.entropy_models_mut() {
            updated |= model.update(scale_table, force, update_quantiles);
        }
        updated
    }

    /// Every sub-model is calibrated
    fn entropy_models_calibrated(&self) -> bool {
        self.entropy_models().iter().all(|m| m.is_calibrated())
    }
}

// -------------------------------------------------------------------------
// Tests
// -------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(b: usize, c: usize, h: usize, w: usize) -> Array4<f32> {
        Array4::from_shape_fn((b, c, h, w), |(bi, ci, y, x)| {
            ((bi + 1) as f32 * 0.1 + ci as f32 * 0.07 + (y * w + x) as f32 * 0.013).sin()
        })
    }

    #[test]
    fn test_default_scale_table() {
        let table = default_scale_table();
        assert_eq!(table.len(), SCALES_LEVELS);
        assert!((table[0] - 0.11).abs() < 1e-5);
        assert!((table[SCALES_LEVELS - 1] - 256.0).abs() < 1e-2);
        assert!(table.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn test_scale_table_degenerate_levels() {
        assert!(scale_table(0.11, 256.0, 0).is_empty());
        assert_eq!(scale_table(0.5, 256.0, 1), vec![0.5]);
    }

    #[test]
    fn test_quantize_symbol_clamps() {
        assert_eq!(quantize_symbol(1.4), 1);
        assert_eq!(quantize_symbol(-2.6), -3);
        assert_eq!(quantize_symbol(1000.0), MAX_SYMBOL);
        assert_eq!(quantize_symbol(-1000.0), MIN_SYMBOL);
    }

    #[test]
    fn test_estimate_bits_far_from_mean() {
        let means = vec![0.0, 0.0, 0.0];
        let scales = vec![1.0, 1.0, 1.0];
        let bits_far = estimate_bits(&[10, -10, 20], &means, &scales);
        let bits_close = estimate_bits(&[0, 0, 0], &means, &scales);
        assert!(bits_close > 0.0);
        assert!(bits_far > bits_close);
        assert!(estimate_bits(&[0], &means, &scales).is_infinite());
    }

    #[test]
    fn test_ans_roundtrip() {
        let symbols = vec![5, -3, 12, 0, -7, 8, -1, 3];
        let params: Vec<(f64, f64)> = vec![
            (4.5, 1.0),
            (-2.8, 1.5),
            (11.2, 2.0),
            (0.1, 0.5),
            (-6.5, 1.2),
            (7.8, 1.8),
            (-0.9, 0.8),
            (2.5, 1.1),
        ];
        let words = ans_encode(&symbols, &params).unwrap();
        assert_eq!(ans_decode(words, &params).unwrap(), symbols);
    }

    #[test]
    fn test_bottleneck_update_is_idempotent() {
        let mut eb = EntropyBottleneck::new(4);
        assert!(!eb.is_calibrated());
        assert!(eb.update(false, false));
        assert!(!eb.update(false, false));
        assert!(eb.update(true, false));
    }

    #[test]
    fn test_bottleneck_recentres_quantiles() {
        let mut eb = EntropyBottleneck::new(1);
        eb.quantiles[[0, 0]] = -2.0;
        eb.quantiles[[0, 1]] = 1.0;
        eb.quantiles[[0, 2]] = 6.0;
        eb.update(true, true);
        assert_eq!(eb.quantiles.row(0).to_vec(), vec![-3.0, 1.0, 5.0]);
    }

    #[test]
    fn test_gaussian_conditional_scale_index() {
        let table = vec![0.5, 1.0, 2.0, 4.0];
        assert_eq!(GaussianConditional::find_scale_index(&table, 0.1), 0);
        assert_eq!(GaussianConditional::find_scale_index(&table, 1.0), 1);
        assert_eq!(GaussianConditional::find_scale_index(&table, 1.5), 2);
        assert_eq!(GaussianConditional::find_scale_index(&table, 100.0), 3);
    }

    #[test]
    fn test_gaussian_conditional_rejects_empty_table() {
        let mut gc = GaussianConditional::default();
        assert!(!gc.update_scale_table(&[], false));
        assert!(!gc.is_calibrated());
        assert!(gc.update_scale_table(&[2.0, 1.0, 1.0], false));
        assert_eq!(gc.scale_table().unwrap(), &[1.0, 2.0]);
    }

    #[test]
    fn test_compress_before_calibration_fails() {
        let compressor = HyperpriorCompressor::new(3);
        let err = compressor.compress(&pattern(1, 3, 4, 4)).unwrap_err();
        assert!(err.is_calibration_error());

        let record = BitstreamRecord::new(vec![0; 12], vec![0; 12], LatentShape::of(&pattern(1, 3, 4, 4)));
        assert!(compressor.decompress(&record).unwrap_err().is_calibration_error());
    }

    #[test]
    fn test_estimate_works_uncalibrated() {
        let compressor = HyperpriorCompressor::new(3);
        let estimate = compressor.estimate(&pattern(2, 3, 4, 6)).unwrap();
        assert_eq!(estimate.reconstruction.shape(), &[2, 3, 4, 6]);
        assert!(estimate.prior_bits > 0.0);
        assert!(estimate.hyperprior_bits > 0.0);
    }

    #[test]
    fn test_compressor_roundtrip_matches_estimate() {
        let mut compressor = HyperpriorCompressor::new(3);
        assert!(compressor.update(None, false, false));
        assert!(!compressor.update(None, false, false));

        let x = pattern(2, 3, 6, 5);
        let record = compressor.compress(&x).unwrap();
        assert_eq!(record.shape, LatentShape::of(&x));

        let decoded = compressor.decompress(&record).unwrap();
        let estimate = compressor.estimate(&x).unwrap();
        assert_eq!(decoded, estimate.reconstruction);

        let max_err = decoded
            .iter()
            .zip(x.iter())
            .map(|(a, b)| (a - b).abs())
            .fold(0.0f32, f32::max);
        assert!(max_err <= 0.5 / DEFAULT_QUANT_GAIN + 1e-6);
    }

    #[test]
    fn test_compress_is_deterministic() {
        let mut compressor = HyperpriorCompressor::new(2);
        compressor.update(None, true, false);
        let x = pattern(1, 2, 4, 4);
        assert_eq!(compressor.compress(&x).unwrap(), compressor.compress(&x).unwrap());
    }

    #[test]
    fn test_truncated_prior_is_decode_error() {
        let mut compressor = HyperpriorCompressor::new(3);
        compressor.update(None, true, false);
        let mut record = compressor.compress(&pattern(1, 3, 4, 4)).unwrap();
        let keep = record.prior.len() / 2;
        record.prior.truncate(keep);
        assert!(compressor.decompress(&record).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_inconsistent_shape_is_decode_error() {
        let mut compressor = HyperpriorCompressor::new(3);
        compressor.update(None, true, false);
        let record = compressor.compress(&pattern(1, 3, 4, 4)).unwrap();

        let mut taller = record.clone();
        taller.shape.height = 8;
        assert!(compressor.decompress(&taller).unwrap_err().is_decode_error());

        let mut wider_channels = record.clone();
        wider_channels.shape.channels = 4;
        assert!(compressor.decompress(&wider_channels).unwrap_err().is_decode_error());

        assert!(compressor
            .decompress(&BitstreamRecord::empty())
            .unwrap_err()
            .is_decode_error());
    }

    #[test]
    fn test_oversized_record_shape_is_decode_error() {
        let mut compressor = HyperpriorCompressor::new(3);
        compressor.update(None, true, false);
        let record = compressor.compress(&pattern(1, 3, 4, 4)).unwrap();

        let mut huge = record.clone();
        huge.shape.height = 1 << 31;
        huge.shape.width = 1 << 31;
        let err = compressor.decompress(&huge).unwrap_err();
        assert!(err.is_decode_error(), "{:?}", err);

        let mut overflowing = record.clone();
        overflowing.shape.batch = 1 << 20;
        overflowing.shape.height = 1 << 20;
        overflowing.shape.width = 1 << 28;
        assert!(compressor.decompress(&overflowing).unwrap_err().is_decode_error());

        // same element count, different layout: the side stream no longer agrees
        let mut reshaped = record.clone();
        reshaped.shape.height = 16;
        reshaped.shape.width = 1;
        assert!(compressor.decompress(&reshaped).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_lying_symbol_count_is_decode_error() {
        let mut compressor = HyperpriorCompressor::new(3);
        compressor.update(None, true, false);
        let mut record = compressor.compress(&pattern(1, 3, 4, 4)).unwrap();
        record.prior[..4].copy_from_slice(&u32::MAX.to_le_bytes());
        record.shape.height = 1 << 16;
        record.shape.width = 21845;
        assert!(compressor.decompress(&record).unwrap_err().is_decode_error());
    }

    #[test]
    fn test_custom_scale_table() {
        let mut compressor = HyperpriorCompressor::new(1);
        assert!(compressor.update(Some(&[0.5, 1.0, 2.0]), false, false));
        assert_eq!(compressor.scale_table().unwrap().len(), 3);
        assert!(compressor.update(None, true, false));
        assert_eq!(compressor.scale_table().unwrap().len(), SCALES_LEVELS);
    }

    #[test]
    fn test_parameter_names() {
        let compressor = HyperpriorCompressor::new(2);
        let names: Vec<String> = compressor
            .named_parameters()
            .into_iter()
            .map(|(n, _)| n)
            .collect();
        assert!(names.contains(&"gain".to_string()));
        assert!(names.contains(&"entropy_bottleneck.quantiles".to_string()));
    }
}
