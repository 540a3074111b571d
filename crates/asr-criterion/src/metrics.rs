//! Aggregation of per-batch logging outputs.

use std::f64::consts::LN_2;

use serde::Serialize;

use crate::cross_entropy::LoggingOutput;

/// Aggregated training statistics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Metrics {
    /// Loss per `sample_size` unit, base 2.
    pub loss: f64,
    /// Loss per target token, base 2.
    pub nll_loss: f64,
    /// Perplexity, `2^nll_loss`.
    pub ppl: f64,
    pub ntokens: usize,
    pub nsentences: usize,
    pub sample_size: usize,
}

/// Sum logging outputs from several batches (or workers) into [`Metrics`].
///
/// `nll_loss` equals `loss` when the sample size already counts tokens;
/// with sentence averaging it is renormalized by the token count.
pub fn reduce_metrics(logging_outputs: &[LoggingOutput]) -> Metrics {
    let loss_sum: f64 = logging_outputs.iter().map(|l| l.loss).sum();
    let ntokens: usize = logging_outputs.iter().map(|l| l.ntokens).sum();
    let nsentences: usize = logging_outputs.iter().map(|l| l.nsentences).sum();
    let sample_size: usize = logging_outputs.iter().map(|l| l.sample_size).sum();

    let per = |count: usize| {
        if count == 0 {
            0.0
        } else {
            loss_sum / count as f64 / LN_2
        }
    };
    let loss = per(sample_size);
    let nll_loss = if sample_size != ntokens { per(ntokens) } else { loss };

    Metrics {
        loss,
        nll_loss,
        ppl: 2f64.powf(nll_loss),
        ntokens,
        nsentences,
        sample_size,
    }
}
