//! Word, character and relation vocabularies plus the task registry.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::corpus::conll::Corpus;
use crate::error::{KakariError, Result};
use crate::types::{GoldTree, Instance, Sentence};

pub const PAD: &str = "<pad>";
pub const UNK: &str = "<unk>";
pub const ROOT: &str = "<root>";

/// Vocabulary shared by every task, with one relation label set per task.
///
/// Fixed once built or loaded; all lookups are read-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Vocab {
    words: Vec<String>,
    chars: Vec<String>,
    tasks: Vec<String>,
    rels: Vec<Vec<String>>,
    puncts: Vec<usize>,
    #[serde(skip)]
    word_index: HashMap<String, usize>,
    #[serde(skip)]
    char_index: HashMap<String, usize>,
    #[serde(skip)]
    rel_index: Vec<HashMap<String, usize>>,
}

impl Vocab {
    pub const PAD_INDEX: usize = 0;
    pub const UNK_INDEX: usize = 1;
    pub const ROOT_INDEX: usize = 2;

    /// Build from training corpora whose sentences carry task ids into `tasks`.
    ///
    /// Words seen fewer than `min_freq` times map to `<unk>`.
    pub fn build(tasks: Vec<String>, corpora: &[&Corpus], min_freq: usize) -> Result<Self> {
        let mut word_counts: HashMap<&str, usize> = HashMap::new();
        let mut word_order: Vec<&str> = Vec::new();
        let mut chars: Vec<String> = Vec::new();
        let mut rels: Vec<Vec<String>> = vec![Vec::new(); tasks.len()];

        for sentence in corpora.iter().flat_map(|c| c.iter()) {
            if sentence.task >= tasks.len() {
                return Err(KakariError::UnknownTask(format!("task id {}", sentence.task)));
            }
            for token in &sentence.tokens {
                let count = word_counts.entry(token.form.as_str()).or_insert(0);
                if *count == 0 {
                    word_order.push(token.form.as_str());
                }
                *count += 1;
                for c in token.form.chars() {
                    let c = c.to_string();
                    if !chars.contains(&c) {
                        chars.push(c);
                    }
                }
                if let Some(rel) = &token.deprel {
                    let labels = &mut rels[sentence.task];
                    if !labels.contains(rel) {
                        labels.push(rel.clone());
                    }
                }
            }
        }

        let specials = || vec![PAD.to_string(), UNK.to_string(), ROOT.to_string()];
        let mut words = specials();
        words.extend(
            word_order
                .into_iter()
                .filter(|w| word_counts[w] >= min_freq)
                .map(str::to_string),
        );
        let mut all_chars = specials();
        all_chars.extend(chars);
        for labels in &mut rels {
            labels.sort();
        }

        let mut vocab = Self {
            words,
            chars: all_chars,
            tasks,
            rels,
            puncts: Vec::new(),
            word_index: HashMap::new(),
            char_index: HashMap::new(),
            rel_index: Vec::new(),
        };
        vocab.puncts = vocab.find_puncts()?;
        vocab.reindex();
        info!(
            words = vocab.n_words(),
            chars = vocab.n_chars(),
            tasks = vocab.tasks.len(),
            "built vocabulary"
        );
        Ok(vocab)
    }

    /// Load a vocabulary saved with [`Vocab::save`].
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let mut vocab: Vocab = serde_json::from_str(&text)?;
        if vocab.rels.len() != vocab.tasks.len() {
            return Err(KakariError::ModelLoad(format!(
                "{} relation sets for {} tasks",
                vocab.rels.len(),
                vocab.tasks.len()
            )));
        }
        vocab.reindex();
        Ok(vocab)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    fn reindex(&mut self) {
        self.word_index = index(&self.words);
        self.char_index = index(&self.chars);
        self.rel_index = self.rels.iter().map(|labels| index(labels)).collect();
    }

    fn find_puncts(&self) -> Result<Vec<usize>> {
        let punct = Regex::new(r"^\p{P}+$")?;
        Ok(self
            .words
            .iter()
            .enumerate()
            .skip(Self::ROOT_INDEX + 1)
            .filter(|(_, w)| punct.is_match(w))
            .map(|(i, _)| i)
            .collect())
    }

    pub fn n_words(&self) -> usize {
        self.words.len()
    }

    pub fn n_chars(&self) -> usize {
        self.chars.len()
    }

    pub fn tasks(&self) -> &[String] {
        &self.tasks
    }

    /// Number of relation labels of `task`.
    pub fn n_rels(&self, task: usize) -> usize {
        self.rels.get(task).map_or(0, Vec::len)
    }

    pub fn puncts(&self) -> &[usize] {
        &self.puncts
    }

    pub fn is_punct(&self, word: usize) -> bool {
        self.puncts.binary_search(&word).is_ok()
    }

    /// Resolve a task name to its id.
    pub fn task_id(&self, name: &str) -> Result<usize> {
        self.tasks
            .iter()
            .position(|t| t == name)
            .ok_or_else(|| KakariError::UnknownTask(name.to_string()))
    }

    pub fn word_id(&self, word: &str) -> usize {
        self.word_index.get(word).copied().unwrap_or(Self::UNK_INDEX)
    }

    pub fn char_id(&self, c: char) -> usize {
        let mut buf = [0u8; 4];
        self.char_index
            .get(c.encode_utf8(&mut buf) as &str)
            .copied()
            .unwrap_or(Self::UNK_INDEX)
    }

    pub fn rel_id(&self, task: usize, rel: &str) -> Option<usize> {
        self.rel_index.get(task)?.get(rel).copied()
    }

    /// Relation names for predicted ids of `task`.
    pub fn id2rel(&self, task: usize, ids: &[Option<usize>]) -> Vec<Option<String>> {
        let labels = self.rels.get(task);
        ids.iter()
            .map(|id| id.and_then(|i| labels.and_then(|l| l.get(i)).cloned()))
            .collect()
    }

    /// Turn a sentence into ids, prepending the root.
    ///
    /// Relations unknown to the sentence's task are left unannotated.
    pub fn numericalize(&self, sentence: &Sentence) -> Result<Instance> {
        if sentence.task >= self.tasks.len() {
            return Err(KakariError::UnknownTask(format!("task id {}", sentence.task)));
        }
        let n = sentence.len() + 1;
        let mut words = Vec::with_capacity(n);
        let mut chars = Vec::with_capacity(n);
        let mut gold = GoldTree::unannotated(n);

        words.push(Self::ROOT_INDEX);
        chars.push(vec![Self::ROOT_INDEX]);
        for (i, token) in sentence.tokens.iter().enumerate() {
            words.push(self.word_id(&token.form));
            let mut ids: Vec<usize> = token.form.chars().map(|c| self.char_id(c)).collect();
            if ids.is_empty() {
                ids.push(Self::UNK_INDEX);
            }
            chars.push(ids);
            gold.heads[i + 1] = token.head;
            gold.rels[i + 1] = token
                .deprel
                .as_deref()
                .and_then(|rel| self.rel_id(sentence.task, rel));
        }

        Ok(Instance {
            words,
            chars,
            gold,
            task: sentence.task,
        })
    }

    pub fn numericalize_corpus(&self, corpus: &Corpus) -> Result<Vec<Instance>> {
        corpus.iter().map(|s| self.numericalize(s)).collect()
    }
}

fn index(items: &[String]) -> HashMap<String, usize> {
    items
        .iter()
        .enumerate()
        .map(|(i, item)| (item.clone(), i))
        .collect()
}
