//! Alignment collapsing at decode time.
//!
//! Both decoders work on host copies of the per-sequence log-probabilities,
//! `[time][classes]`, truncated to the sequence's input length.

use std::collections::HashMap;

/// Best label sequence with its log-probability.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub labels: Vec<u32>,
    pub log_prob: f32,
}

fn log_add(a: f32, b: f32) -> f32 {
    if a == f32::NEG_INFINITY {
        return b;
    }
    if b == f32::NEG_INFINITY {
        return a;
    }
    let max = a.max(b);
    max + ((a - max).exp() + (b - max).exp()).ln()
}

fn argmax(row: &[f32]) -> (u32, f32) {
    row.iter()
        .enumerate()
        .fold((0u32, f32::NEG_INFINITY), |best, (i, &value)| {
            if value > best.1 {
                (i as u32, value)
            } else {
                best
            }
        })
}

/// Best class per step, with repeats merged (optionally) and blanks removed.
pub fn greedy_decode(log_probs: &[Vec<f32>], blank: u32, merge_repeated: bool) -> Hypothesis {
    let mut labels = Vec::new();
    let mut log_prob = 0.0;
    let mut previous = None;
    for row in log_probs {
        let (class, score) = argmax(row);
        log_prob += score;
        let repeated = merge_repeated && previous == Some(class);
        if class != blank && !repeated {
            labels.push(class);
        }
        previous = Some(class);
    }
    Hypothesis { labels, log_prob }
}

#[derive(Debug, Clone, Copy)]
struct PrefixScore {
    blank: f32,
    non_blank: f32,
}

impl PrefixScore {
    const EMPTY: Self = Self {
        blank: f32::NEG_INFINITY,
        non_blank: f32::NEG_INFINITY,
    };

    fn total(&self) -> f32 {
        log_add(self.blank, self.non_blank)
    }
}

/// CTC prefix beam search keeping `beam_width` prefixes per step.
///
/// Without `merge_repeated`, every non-blank emission extends the prefix, so
/// a label held over two steps yields two labels.
pub fn beam_search_decode(
    log_probs: &[Vec<f32>],
    blank: u32,
    beam_width: usize,
    merge_repeated: bool,
) -> Hypothesis {
    let mut beams: Vec<(Vec<u32>, PrefixScore)> = vec![(
        Vec::new(),
        PrefixScore {
            blank: 0.0,
            non_blank: f32::NEG_INFINITY,
        },
    )];

    for row in log_probs {
        let mut next: HashMap<Vec<u32>, PrefixScore> = HashMap::new();
        for (prefix, score) in &beams {
            let total = score.total();
            let entry = next.entry(prefix.clone()).or_insert(PrefixScore::EMPTY);
            entry.blank = log_add(entry.blank, total + row[blank as usize]);

            for (class, &emission) in row.iter().enumerate() {
                let class = class as u32;
                if class == blank {
                    continue;
                }
                let mut extended = prefix.clone();
                extended.push(class);
                if merge_repeated && prefix.last() == Some(&class) {
                    let held = next.entry(prefix.clone()).or_insert(PrefixScore::EMPTY);
                    held.non_blank = log_add(held.non_blank, score.non_blank + emission);
                    let entry = next.entry(extended).or_insert(PrefixScore::EMPTY);
                    entry.non_blank = log_add(entry.non_blank, score.blank + emission);
                } else {
                    let entry = next.entry(extended).or_insert(PrefixScore::EMPTY);
                    entry.non_blank = log_add(entry.non_blank, total + emission);
                }
            }
        }

        let mut ranked: Vec<(Vec<u32>, PrefixScore)> = next.into_iter().collect();
        ranked.sort_by(|a, b| {
            b.1.total()
                .total_cmp(&a.1.total())
                .then_with(|| a.0.len().cmp(&b.0.len()))
                .then_with(|| a.0.cmp(&b.0))
        });
        ranked.truncate(beam_width.max(1));
        beams = ranked;
    }

    beams
        .into_iter()
        .next()
        .map(|(labels, score)| Hypothesis {
            labels,
            log_prob: score.total(),
        })
        .unwrap_or(Hypothesis {
            labels: Vec::new(),
            log_prob: 0.0,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log_rows(rows: &[&[f32]]) -> Vec<Vec<f32>> {
        rows.iter()
            .map(|row| row.iter().map(|p| p.ln()).collect())
            .collect()
    }

    #[test]
    fn greedy_merges_repeats_and_drops_blanks() {
        // classes: 0, 1, blank = 2
        let rows = log_rows(&[
            &[0.6, 0.1, 0.3],
            &[0.7, 0.1, 0.2],
            &[0.1, 0.1, 0.8],
            &[0.8, 0.1, 0.1],
            &[0.1, 0.7, 0.2],
        ]);
        assert_eq!(greedy_decode(&rows, 2, true).labels, vec![0, 0, 1]);
        assert_eq!(greedy_decode(&rows, 2, false).labels, vec![0, 0, 0, 1]);
    }

    #[test]
    fn beam_search_sums_alignments_greedy_cannot_see() {
        // Greedy picks blank at both steps, but the label `0` has more mass
        // spread over its three alignments (0.4*0.6 + 0.6*0.4 + 0.4*0.4 = 0.64).
        let rows = log_rows(&[&[0.4, 0.0001, 0.5999], &[0.4, 0.0001, 0.5999]]);
        assert!(greedy_decode(&rows, 2, true).labels.is_empty());
        let best = beam_search_decode(&rows, 2, 4, true);
        assert_eq!(best.labels, vec![0]);
    }

    #[test]
    fn beam_width_one_matches_greedy_on_peaked_inputs() {
        let rows = log_rows(&[&[0.9, 0.05, 0.05], &[0.05, 0.05, 0.9], &[0.05, 0.9, 0.05]]);
        assert_eq!(
            beam_search_decode(&rows, 2, 1, true).labels,
            greedy_decode(&rows, 2, true).labels
        );
    }
}
