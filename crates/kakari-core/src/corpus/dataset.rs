//! Length-bucketed batching of numericalized sentences.

use oorandom::Rand32;
use tracing::debug;

use crate::corpus::vocab::Vocab;
use crate::error::{KakariError, Result};
use crate::types::{GoldTree, Instance};

/// Sentences grouped into length buckets and cut into token-budget batches.
#[derive(Debug, Clone)]
pub struct TextDataset {
    instances: Vec<Instance>,
    buckets: Vec<Vec<usize>>,
    batches: Vec<Vec<usize>>,
    batch_size: usize,
}

impl TextDataset {
    /// Bucket `instances` into at most `n_buckets` groups of similar length.
    ///
    /// `batch_size` is a token budget: a bucket holding `T` tokens is split
    /// into `ceil(T / batch_size)` batches of near-equal sentence counts.
    pub fn new(instances: Vec<Instance>, n_buckets: usize, batch_size: usize) -> Result<Self> {
        if batch_size == 0 {
            return Err(KakariError::ShapeMismatch("batch size must be positive".into()));
        }
        let buckets = quantile_buckets(&instances, n_buckets.max(1));
        let batches = buckets
            .iter()
            .flat_map(|bucket| split_bucket(&instances, bucket, batch_size))
            .collect::<Vec<_>>();
        debug!(
            sentences = instances.len(),
            buckets = buckets.len(),
            batches = batches.len(),
            "bucketed dataset"
        );
        Ok(Self {
            instances,
            buckets,
            batches,
            batch_size,
        })
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Instance] {
        &self.instances
    }

    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn n_batches(&self) -> usize {
        self.batches.len()
    }

    /// Batch index lists for one pass over the data.
    ///
    /// With a generator, sentences are shuffled inside each bucket before
    /// batching and the batch order is shuffled too.
    pub fn batches(&self, rng: Option<&mut Rand32>) -> Vec<Vec<usize>> {
        let Some(rng) = rng else {
            return self.batches.clone();
        };
        let mut batches = Vec::with_capacity(self.batches.len());
        for bucket in &self.buckets {
            let mut bucket = bucket.clone();
            shuffle(&mut bucket, rng);
            batches.extend(split_bucket(&self.instances, &bucket, self.batch_size));
        }
        shuffle(&mut batches, rng);
        batches
    }

    /// Pad the selected instances into one batch.
    pub fn collate(&self, indices: &[usize]) -> Result<Batch> {
        let items = indices
            .iter()
            .map(|&i| {
                self.instances.get(i).ok_or_else(|| {
                    KakariError::ShapeMismatch(format!(
                        "instance {i} out of {}",
                        self.instances.len()
                    ))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Batch::collate(indices.to_vec(), &items)
    }
}

/// Padded ids of a batch, ready to be turned into tensors.
#[derive(Debug, Clone)]
pub struct Batch {
    /// Dataset positions of the batch members, in batch order.
    pub indices: Vec<usize>,
    /// `[size, max_len]` word ids, padded with `<pad>`.
    pub words: Vec<u32>,
    /// `[size, max_len, max_chars]` char ids, padded with `<pad>`.
    pub chars: Vec<u32>,
    /// Sentence lengths, root included.
    pub lens: Vec<usize>,
    pub tasks: Vec<usize>,
    pub golds: Vec<GoldTree>,
    pub max_len: usize,
    pub max_chars: usize,
}

impl Batch {
    pub fn collate(indices: Vec<usize>, items: &[&Instance]) -> Result<Self> {
        if items.is_empty() {
            return Err(KakariError::EmptyInput);
        }
        if indices.len() != items.len() {
            return Err(KakariError::ShapeMismatch(format!(
                "{} indices for {} instances",
                indices.len(),
                items.len()
            )));
        }
        let max_len = items.iter().map(|i| i.len()).max().unwrap_or(0);
        let max_chars = items
            .iter()
            .flat_map(|i| i.chars.iter().map(Vec::len))
            .max()
            .unwrap_or(0)
            .max(1);
        let pad = Vocab::PAD_INDEX as u32;
        let mut words = vec![pad; items.len() * max_len];
        let mut chars = vec![pad; items.len() * max_len * max_chars];
        for (b, item) in items.iter().enumerate() {
            for (t, &word) in item.words.iter().enumerate() {
                words[b * max_len + t] = word as u32;
            }
            for (t, word_chars) in item.chars.iter().enumerate() {
                let base = (b * max_len + t) * max_chars;
                for (c, &id) in word_chars.iter().enumerate() {
                    chars[base + c] = id as u32;
                }
            }
        }
        Ok(Self {
            indices,
            words,
            chars,
            lens: items.iter().map(|i| i.len()).collect(),
            tasks: items.iter().map(|i| i.task).collect(),
            golds: items.iter().map(|i| i.gold.clone()).collect(),
            max_len,
            max_chars,
        })
    }

    pub fn size(&self) -> usize {
        self.lens.len()
    }

    /// Word positions of batch member `b` that are real dependents.
    pub fn mask(&self, b: usize) -> Vec<bool> {
        let len = self.lens.get(b).copied().unwrap_or(0);
        (0..len).map(|i| i > 0).collect()
    }

    /// Word ids of batch member `b`, padding stripped.
    pub fn words_of(&self, b: usize) -> &[u32] {
        let len = self.lens.get(b).copied().unwrap_or(0);
        let start = b * self.max_len;
        &self.words[start..start + len]
    }

    /// Number of scored words (root excluded).
    pub fn n_tokens(&self) -> usize {
        self.lens.iter().map(|l| l.saturating_sub(1)).sum()
    }
}

fn quantile_buckets(instances: &[Instance], n_buckets: usize) -> Vec<Vec<usize>> {
    let mut order: Vec<usize> = (0..instances.len()).collect();
    order.sort_by_key(|&i| (instances[i].len(), i));
    if order.is_empty() {
        return Vec::new();
    }
    let n_buckets = n_buckets.min(order.len());
    let mut buckets: Vec<Vec<usize>> = Vec::with_capacity(n_buckets);
    for k in 0..n_buckets {
        let start = k * order.len() / n_buckets;
        let end = (k + 1) * order.len() / n_buckets;
        let mut bucket = order[start..end].to_vec();
        // Keep equal lengths together so bucket boundaries stay sharp.
        if let (Some(prev), Some(&first)) = (buckets.last_mut(), bucket.first()) {
            let boundary = instances[first].len();
            let moved = bucket
                .iter()
                .take_while(|&&i| instances[i].len() == boundary)
                .count();
            if prev.last().is_some_and(|&p| instances[p].len() == boundary) {
                prev.extend(bucket.drain(..moved));
            }
        }
        if !bucket.is_empty() {
            buckets.push(bucket);
        }
    }
    buckets
}

fn split_bucket(instances: &[Instance], bucket: &[usize], budget: usize) -> Vec<Vec<usize>> {
    if bucket.is_empty() {
        return Vec::new();
    }
    let tokens: usize = bucket.iter().map(|&i| instances[i].len()).sum();
    let chunks = tokens.div_ceil(budget).clamp(1, bucket.len());
    (0..chunks)
        .map(|k| {
            let start = k * bucket.len() / chunks;
            let end = (k + 1) * bucket.len() / chunks;
            bucket[start..end].to_vec()
        })
        .filter(|chunk| !chunk.is_empty())
        .collect()
}

fn shuffle<T>(items: &mut [T], rng: &mut Rand32) {
    for i in (1..items.len()).rev() {
        let j = rng.rand_range(0..(i as u32 + 1)) as usize;
        items.swap(i, j);
    }
}
