//! Tree inference checked against brute-force enumeration of small sentences.

use kakari_core::inference::{
    Chart, EisnerDecoder, MaxSemiring, constrained_log_partition, log_partition, log_sum_exp,
    marginals,
};
use kakari_core::loss::{LossAssembler, LossMode};
use kakari_core::types::{GoldTree, RelScores, ScoreMatrix, SentenceScores, check_heads};
use oorandom::Rand32;

const TOL: f64 = 1e-8;

fn random_scores(n: usize, rng: &mut Rand32) -> ScoreMatrix {
    ScoreMatrix::from_fn(n, |_, _| f64::from(rng.rand_float()) * 6.0 - 3.0)
}

/// Every single-rooted projective tree over `n` positions (root included).
fn all_trees(n: usize) -> Vec<Vec<Option<usize>>> {
    let mut trees = Vec::new();
    let mut heads = vec![None; n];
    enumerate(1, n, &mut heads, &mut trees);
    trees
}

fn enumerate(
    dep: usize,
    n: usize,
    heads: &mut Vec<Option<usize>>,
    out: &mut Vec<Vec<Option<usize>>>,
) {
    if dep == n {
        if check_heads(heads).is_ok() {
            out.push(heads.clone());
        }
        return;
    }
    for head in (0..n).filter(|&h| h != dep) {
        heads[dep] = Some(head);
        enumerate(dep + 1, n, heads, out);
    }
    heads[dep] = None;
}

fn tree_score(scores: &ScoreMatrix, heads: &[Option<usize>]) -> f64 {
    heads
        .iter()
        .enumerate()
        .filter_map(|(d, h)| h.map(|h| scores.get(h, d)))
        .sum()
}

#[test]
fn eisner_output_is_always_a_projective_tree() {
    let mut rng = Rand32::new(11);
    let decoder = EisnerDecoder::new();
    for n in 2..=14 {
        for _ in 0..20 {
            let scores = random_scores(n, &mut rng);
            let heads = decoder.decode(&scores).unwrap();
            assert_eq!(check_heads(&heads), Ok(()), "n = {n}, heads = {heads:?}");
        }
    }
}

#[test]
fn decoding_is_deterministic() {
    let mut rng = Rand32::new(5);
    let decoder = EisnerDecoder::new();
    for n in [2, 5, 9] {
        let scores = random_scores(n, &mut rng);
        assert_eq!(decoder.decode(&scores).unwrap(), decoder.decode(&scores).unwrap());
    }
    let flat = ScoreMatrix::filled(6, 1.0);
    assert_eq!(decoder.decode(&flat).unwrap(), decoder.decode(&flat).unwrap());
}

#[test]
fn zero_scores_count_projective_trees() {
    for (n, expected) in [(2, 1usize), (3, 2), (4, 7), (5, 30), (6, 143)] {
        let trees = all_trees(n);
        assert_eq!(trees.len(), expected, "n = {n}");
        let log_z = log_partition(&ScoreMatrix::filled(n, 0.0)).unwrap();
        assert!((log_z - (expected as f64).ln()).abs() < TOL, "n = {n}: {log_z}");
    }
}

#[test]
fn log_partition_matches_brute_force() {
    let mut rng = Rand32::new(3);
    for n in 2..=6 {
        let scores = random_scores(n, &mut rng);
        let totals: Vec<f64> = all_trees(n).iter().map(|t| tree_score(&scores, t)).collect();
        let expected = log_sum_exp(&totals);
        let log_z = log_partition(&scores).unwrap();
        assert!((log_z - expected).abs() < 1e-6, "n = {n}: {log_z} vs {expected}");
    }
}

#[test]
fn max_inside_reproduces_eisner_tree() {
    let mut rng = Rand32::new(17);
    let decoder = EisnerDecoder::new();
    for n in 2..=6 {
        let scores = random_scores(n, &mut rng);
        let chart = Chart::<MaxSemiring>::fill(&scores);
        let heads = decoder.decode(&scores).unwrap();
        let best = all_trees(n)
            .iter()
            .map(|t| tree_score(&scores, t))
            .fold(f64::NEG_INFINITY, f64::max);
        assert!((chart.root_score() - best).abs() < TOL);
        assert!((tree_score(&scores, &heads) - best).abs() < TOL);
        assert_eq!(chart.backtrack(), heads);
    }
}

#[test]
fn constrained_partition_matches_brute_force() {
    let mut rng = Rand32::new(23);
    let n = 5;
    let scores = random_scores(n, &mut rng);
    let trees = all_trees(n);
    for dep in 1..n {
        for head in (0..n).filter(|&h| h != dep) {
            let mut constraint = vec![None; n];
            constraint[dep] = Some(head);
            let matching: Vec<f64> = trees
                .iter()
                .filter(|t| t[dep] == Some(head))
                .map(|t| tree_score(&scores, t))
                .collect();
            let expected = log_sum_exp(&matching);
            let got = constrained_log_partition(&scores, &constraint).unwrap();
            if expected == f64::NEG_INFINITY {
                assert_eq!(got, f64::NEG_INFINITY, "{head} -> {dep}");
            } else {
                assert!((got - expected).abs() < 1e-6, "{head} -> {dep}: {got} vs {expected}");
            }
        }
    }
}

#[test]
fn marginals_sum_to_one_and_match_brute_force() {
    let mut rng = Rand32::new(29);
    for n in 2..=6 {
        let scores = random_scores(n, &mut rng);
        let m = marginals(&scores).unwrap();
        for dep in 1..n {
            let total: f64 = m.probs.column(dep).sum();
            assert!((total - 1.0).abs() < 1e-6, "n = {n}, dep = {dep}: {total}");
        }

        let trees = all_trees(n);
        let weights: Vec<f64> = trees.iter().map(|t| tree_score(&scores, t)).collect();
        let log_z = log_sum_exp(&weights);
        for dep in 1..n {
            for head in 0..n {
                let expected: f64 = trees
                    .iter()
                    .zip(&weights)
                    .filter(|(t, _)| t[dep] == Some(head))
                    .map(|(_, w)| (w - log_z).exp())
                    .sum();
                assert!((m.probs.get(head, dep) - expected).abs() < 1e-6);
            }
        }
    }
}

#[test]
fn chain_scenario_decodes_to_chain() {
    let mut scores = ScoreMatrix::filled(4, -10.0);
    scores.set(0, 1, 5.0);
    scores.set(1, 2, 5.0);
    scores.set(2, 3, 5.0);
    let heads = EisnerDecoder::new().decode(&scores).unwrap();
    assert_eq!(heads, vec![None, Some(0), Some(1), Some(2)]);
}

#[test]
fn crf_loss_is_never_negative() {
    let mut rng = Rand32::new(31);
    let assembler = LossAssembler::new(LossMode::Structured { partial: true });
    for n in 2..=6 {
        let trees = all_trees(n);
        for _ in 0..5 {
            let arcs = random_scores(n, &mut rng);
            let scores = SentenceScores::new(arcs, RelScores::filled(n, 1, 0.0)).unwrap();
            let pick = rng.rand_range(0..trees.len() as u32) as usize;
            let mut gold = GoldTree::unannotated(n);
            for (d, h) in trees[pick].iter().enumerate().skip(1) {
                // Leave every other word unannotated to exercise partial trees.
                if d % 2 == 1 || n < 4 {
                    gold.heads[d] = *h;
                    gold.rels[d] = Some(0);
                }
            }
            let loss = assembler.sentence(&scores, &gold).unwrap();
            assert!(!loss.skipped);
            assert!(loss.arc >= -TOL, "n = {n}: {}", loss.arc);
        }
    }
}
