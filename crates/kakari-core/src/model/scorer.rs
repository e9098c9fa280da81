//! The seam between score producers and tree inference.

use candle_core::{Device, Tensor};

use crate::corpus::Batch;
use crate::error::{KakariError, Result};
use crate::types::{RelScores, ScoreMatrix, SentenceScores};

/// Anything that can score every arc and relation of a batch.
///
/// Results come back in batch order, one unpadded table per sentence.
pub trait ArcScorer {
    fn score(&self, batch: &Batch) -> Result<Vec<SentenceScores>>;
}

/// Scores fixed ahead of time, looked up by dataset position.
#[derive(Debug, Clone, Default)]
pub struct FixedScorer {
    scores: Vec<SentenceScores>,
}

impl FixedScorer {
    pub fn new(scores: Vec<SentenceScores>) -> Self {
        Self { scores }
    }
}

impl ArcScorer for FixedScorer {
    fn score(&self, batch: &Batch) -> Result<Vec<SentenceScores>> {
        batch
            .indices
            .iter()
            .zip(&batch.lens)
            .map(|(&idx, &len)| {
                let scores = self.scores.get(idx).ok_or_else(|| {
                    KakariError::ShapeMismatch(format!("no fixed scores for sentence {idx}"))
                })?;
                if scores.len() != len {
                    return Err(KakariError::ShapeMismatch(format!(
                        "fixed scores of sentence {idx} cover {} positions, batch has {len}",
                        scores.len()
                    )));
                }
                Ok(scores.clone())
            })
            .collect()
    }
}

/// Split padded `[b, L, L]` arc and `[b, L, L, R]` relation tensors
/// (head-major) into per-sentence tables of the given lengths.
pub fn split_scores(arc: &Tensor, rel: &Tensor, lens: &[usize]) -> Result<Vec<SentenceScores>> {
    let (b, max_len, max_len2) = arc.dims3()?;
    let (rb, rl, rl2, labels) = rel.dims4()?;
    if b != lens.len() || max_len != max_len2 || (rb, rl, rl2) != (b, max_len, max_len) {
        return Err(KakariError::ShapeMismatch(format!(
            "arc {:?} / rel {:?} for {} sentences",
            arc.dims(),
            rel.dims(),
            lens.len()
        )));
    }
    let arc: Vec<f32> = arc.flatten_all()?.to_vec1()?;
    let rel: Vec<f32> = rel.flatten_all()?.to_vec1()?;

    let mut out = Vec::with_capacity(b);
    for (i, &n) in lens.iter().enumerate() {
        if n > max_len {
            return Err(KakariError::ShapeMismatch(format!(
                "sentence of length {n} in a batch padded to {max_len}"
            )));
        }
        let arc_base = i * max_len * max_len;
        let arcs = ScoreMatrix::from_fn(n, |h, d| f64::from(arc[arc_base + h * max_len + d]));
        let mut rels = RelScores::filled(n, labels, 0.0);
        for h in 0..n {
            for d in 0..n {
                let base = (arc_base + h * max_len + d) * labels;
                for (r, &value) in rel[base..base + labels].iter().enumerate() {
                    rels.set(h, d, r, f64::from(value));
                }
            }
        }
        out.push(SentenceScores::new(arcs, rels)?);
    }
    Ok(out)
}

/// Pack per-sentence arc gradients into a padded `[b, L, L]` tensor.
///
/// Missing gradients and padding stay zero.
pub fn pack_arc_grads(
    grads: &[Option<&ScoreMatrix>],
    max_len: usize,
    scale: f64,
    device: &Device,
) -> Result<Tensor> {
    let mut data = vec![0f32; grads.len() * max_len * max_len];
    for (i, grad) in grads.iter().enumerate() {
        let Some(grad) = grad else { continue };
        let base = i * max_len * max_len;
        for h in 0..grad.len().min(max_len) {
            for d in 0..grad.len().min(max_len) {
                data[base + h * max_len + d] = (grad.get(h, d) * scale) as f32;
            }
        }
    }
    Ok(Tensor::from_vec(data, (grads.len(), max_len, max_len), device)?)
}

/// Pack per-sentence relation gradients into a padded `[b, L, L, R]` tensor.
pub fn pack_rel_grads(
    grads: &[Option<&RelScores>],
    max_len: usize,
    labels: usize,
    scale: f64,
    device: &Device,
) -> Result<Tensor> {
    let mut data = vec![0f32; grads.len() * max_len * max_len * labels];
    for (i, grad) in grads.iter().enumerate() {
        let Some(grad) = grad else { continue };
        if grad.num_labels() != labels {
            return Err(KakariError::ShapeMismatch(format!(
                "relation gradient over {} labels, expected {labels}",
                grad.num_labels()
            )));
        }
        let n = grad.len().min(max_len);
        for h in 0..n {
            for d in 0..n {
                let base = ((i * max_len + h) * max_len + d) * labels;
                for (r, &g) in grad.labels_for(h, d).iter().enumerate() {
                    data[base + r] = (g * scale) as f32;
                }
            }
        }
    }
    Ok(Tensor::from_vec(
        data,
        (grads.len(), max_len, max_len, labels),
        device,
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{GoldTree, Instance};

    fn batch(lens: &[usize]) -> Batch {
        let instances: Vec<Instance> = lens
            .iter()
            .map(|&n| Instance {
                words: vec![2; n],
                chars: vec![vec![2]; n],
                gold: GoldTree::unannotated(n),
                task: 0,
            })
            .collect();
        let refs: Vec<&Instance> = instances.iter().collect();
        Batch::collate((0..lens.len()).collect(), &refs).unwrap()
    }

    #[test]
    fn test_split_scores_strips_padding() {
        let device = Device::Cpu;
        let arc: Vec<f32> = (0..18).map(|v| v as f32).collect();
        let arc = Tensor::from_vec(arc, (2, 3, 3), &device).unwrap();
        let rel = Tensor::zeros((2, 3, 3, 2), candle_core::DType::F32, &device).unwrap();
        let scores = split_scores(&arc, &rel, &[2, 3]).unwrap();
        assert_eq!(scores[0].len(), 2);
        assert_eq!(scores[0].arcs.get(1, 0), 3.0);
        assert_eq!(scores[1].arcs.get(2, 1), 16.0);
        assert_eq!(scores[1].rels.num_labels(), 2);
    }

    #[test]
    fn test_split_scores_rejects_bad_shapes() {
        let device = Device::Cpu;
        let arc = Tensor::zeros((1, 3, 3), candle_core::DType::F32, &device).unwrap();
        let rel = Tensor::zeros((1, 2, 3, 2), candle_core::DType::F32, &device).unwrap();
        assert!(split_scores(&arc, &rel, &[3]).is_err());
    }

    #[test]
    fn test_pack_arc_grads_pads_with_zero() {
        let device = Device::Cpu;
        let grad = ScoreMatrix::filled(2, 1.0);
        let packed = pack_arc_grads(&[Some(&grad), None], 3, 0.5, &device).unwrap();
        let values: Vec<f32> = packed.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values.iter().sum::<f32>(), 2.0);
        assert_eq!(values[2], 0.0);
    }

    #[test]
    fn test_fixed_scorer_checks_lengths() {
        let scores = vec![SentenceScores::new(
            ScoreMatrix::filled(3, 0.0),
            RelScores::filled(3, 1, 0.0),
        )
        .unwrap()];
        let scorer = FixedScorer::new(scores);
        assert_eq!(scorer.score(&batch(&[3])).unwrap().len(), 1);
        assert!(scorer.score(&batch(&[4])).is_err());
    }
}
