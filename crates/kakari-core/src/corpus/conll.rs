//! CoNLL-X reading and writing.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use tracing::{debug, info};

use crate::error::{KakariError, Result};
use crate::types::{ConllToken, Sentence};

const COLUMNS: usize = 10;

/// All sentences of one treebank file, tagged with a task id.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Corpus {
    pub sentences: Vec<Sentence>,
}

impl Corpus {
    pub fn new(sentences: Vec<Sentence>) -> Self {
        Self { sentences }
    }

    /// Load a CoNLL-X file; every sentence is tagged with `task`.
    pub fn load<P: AsRef<Path>>(path: P, task: usize) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let corpus = Self::read(BufReader::new(file), task)?;
        info!(path = %path.display(), sentences = corpus.len(), "loaded corpus");
        Ok(corpus)
    }

    /// Parse CoNLL-X text from any reader.
    pub fn read<R: BufRead>(reader: R, task: usize) -> Result<Self> {
        let mut sentences = Vec::new();
        let mut current: Vec<ConllToken> = Vec::new();
        let mut start_line = 1;

        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx + 1;
            let line = line?;
            let line = line.trim_end_matches(['\r', '\n']);

            if line.trim().is_empty() {
                if !current.is_empty() {
                    let tokens = std::mem::take(&mut current);
                    sentences.push(finish_sentence(tokens, task, start_line)?);
                }
                start_line = line_no + 1;
                continue;
            }

            if line.starts_with('#') {
                continue;
            }

            if let Some(token) = parse_token(line, line_no)? {
                current.push(token);
            }
        }

        // Don't forget the last sentence
        if !current.is_empty() {
            sentences.push(finish_sentence(current, task, start_line)?);
        }

        Ok(Self { sentences })
    }

    /// Write the corpus back as CoNLL-X.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path.as_ref())?;
        let mut writer = BufWriter::new(file);
        self.write(&mut writer)?;
        writer.flush()?;
        Ok(())
    }

    pub fn write<W: Write>(&self, writer: &mut W) -> Result<()> {
        for sentence in &self.sentences {
            for token in &sentence.tokens {
                let head = token
                    .head
                    .map(|h| h.to_string())
                    .unwrap_or_else(|| "_".to_string());
                writeln!(
                    writer,
                    "{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}\t{}",
                    token.id,
                    token.form,
                    token.lemma,
                    token.cpos,
                    token.pos,
                    token.feats,
                    head,
                    token.deprel.as_deref().unwrap_or("_"),
                    token.phead,
                    token.pdeprel,
                )?;
            }
            writeln!(writer)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.sentences.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sentences.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sentence> {
        self.sentences.iter()
    }
}

/// Parse one token line. Multi-word ranges (`1-2`) and empty nodes (`1.1`)
/// are not part of the basic tree and yield `None`.
fn parse_token(line: &str, line_no: usize) -> Result<Option<ConllToken>> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() != COLUMNS {
        return Err(KakariError::MalformedCorpus {
            line: line_no,
            reason: format!("expected {COLUMNS} tab-separated columns, found {}", parts.len()),
        });
    }
    if parts[0].contains('-') || parts[0].contains('.') {
        debug!(line = line_no, id = parts[0], "skipping non-word token");
        return Ok(None);
    }
    let id = parts[0].parse::<usize>().map_err(|_| KakariError::MalformedCorpus {
        line: line_no,
        reason: format!("token id {:?} is not a number", parts[0]),
    })?;
    let head = match parts[6] {
        "_" | "-1" => None,
        raw => Some(raw.parse::<usize>().map_err(|_| KakariError::MalformedCorpus {
            line: line_no,
            reason: format!("head {raw:?} is not a number"),
        })?),
    };
    let deprel = match parts[7] {
        "_" => None,
        rel => Some(rel.to_string()),
    };
    Ok(Some(ConllToken {
        id,
        form: parts[1].to_string(),
        lemma: parts[2].to_string(),
        cpos: parts[3].to_string(),
        pos: parts[4].to_string(),
        feats: parts[5].to_string(),
        head,
        deprel,
        phead: parts[8].to_string(),
        pdeprel: parts[9].to_string(),
    }))
}

fn finish_sentence(tokens: Vec<ConllToken>, task: usize, start_line: usize) -> Result<Sentence> {
    let len = tokens.len();
    for (offset, token) in tokens.iter().enumerate() {
        if token.id != offset + 1 {
            return Err(KakariError::MalformedCorpus {
                line: start_line,
                reason: format!("token ids are not consecutive at id {}", token.id),
            });
        }
        if let Some(head) = token.head {
            if head > len {
                return Err(KakariError::MalformedCorpus {
                    line: start_line,
                    reason: format!(
                        "head {head} of token {} outside sentence of {len} words",
                        token.id
                    ),
                });
            }
        }
    }
    Ok(Sentence::new(tokens, task))
}
