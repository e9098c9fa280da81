use serde::{Deserialize, Serialize};

/// One CoNLL-X token line.
///
/// `head` is `None` for tokens whose head is intentionally left unannotated
/// (`-1` or `_` in the HEAD column); `Some(0)` attaches to the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConllToken {
    pub id: usize,
    pub form: String,
    pub lemma: String,
    pub cpos: String,
    pub pos: String,
    pub feats: String,
    pub head: Option<usize>,
    pub deprel: Option<String>,
    pub phead: String,
    pub pdeprel: String,
}

impl ConllToken {
    /// A token carrying only its surface form, every other column blank.
    pub fn from_form(id: usize, form: impl Into<String>) -> Self {
        Self {
            id,
            form: form.into(),
            lemma: "_".into(),
            cpos: "_".into(),
            pos: "_".into(),
            feats: "_".into(),
            head: None,
            deprel: None,
            phead: "_".into(),
            pdeprel: "_".into(),
        }
    }
}

/// A sentence read from a treebank, tagged with the task it belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sentence {
    pub tokens: Vec<ConllToken>,
    pub task: usize,
}

impl Sentence {
    pub fn new(tokens: Vec<ConllToken>, task: usize) -> Self {
        Self { tokens, task }
    }

    /// Number of words, the root not included.
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn words(&self) -> impl Iterator<Item = &str> {
        self.tokens.iter().map(|t| t.form.as_str())
    }

    /// Returns `true` if at least one token has an unannotated head.
    pub fn is_partial(&self) -> bool {
        self.tokens.iter().any(|t| t.head.is_none())
    }

    /// Overwrite HEAD and DEPREL with a decoded tree.
    ///
    /// `heads`/`rels` are indexed by word (root excluded).
    pub fn set_prediction(&mut self, heads: &[Option<usize>], rels: &[Option<String>]) {
        for (idx, token) in self.tokens.iter_mut().enumerate() {
            token.head = heads.get(idx).copied().flatten();
            token.deprel = rels.get(idx).cloned().flatten();
        }
    }
}

/// A numericalized sentence, root prepended at position 0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instance {
    pub words: Vec<usize>,
    pub chars: Vec<Vec<usize>>,
    pub gold: GoldTree,
    pub task: usize,
}

impl Instance {
    /// Number of positions, root included.
    pub fn len(&self) -> usize {
        self.words.len()
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

/// Gold heads and relations, root at index 0.
///
/// `None` marks positions excluded from supervision: the root itself and any
/// token whose annotation is missing.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GoldTree {
    pub heads: Vec<Option<usize>>,
    pub rels: Vec<Option<usize>>,
}

impl GoldTree {
    /// A tree with no annotation at all over `len` positions.
    pub fn unannotated(len: usize) -> Self {
        Self {
            heads: vec![None; len],
            rels: vec![None; len],
        }
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// Returns `true` when every word (root excluded) has a known head.
    pub fn is_complete(&self) -> bool {
        self.heads.iter().skip(1).all(Option::is_some)
    }

    /// Word positions with a known head.
    pub fn annotated(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.heads
            .iter()
            .enumerate()
            .skip(1)
            .filter_map(|(dep, head)| head.map(|h| (dep, h)))
    }
}
