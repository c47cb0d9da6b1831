//! # Viterbi Decoding for CRF
//!
//! Finds the highest-scoring tag sequence given per-position emission
//! scores, a tag-to-tag transition matrix and start/end boundary scores.

use crate::error::{KariError, Result};

/// Viterbi decoder for linear-chain CRF tag sequences.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
}

impl ViterbiDecoder {
    /// Create a new Viterbi decoder.
    ///
    /// # Arguments
    /// * `num_tags` - Number of distinct tags
    pub fn new(num_tags: usize) -> Self {
        Self { num_tags }
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    /// Decode the optimal tag sequence.
    ///
    /// # Arguments
    /// * `emission_scores` - Matrix of shape [seq_len, num_tags]
    /// * `transition_matrix` - Matrix of shape [num_tags, num_tags], `[prev][curr]`
    /// * `start` - Score of starting the sequence in each tag
    /// * `end` - Score of ending the sequence in each tag
    ///
    /// # Returns
    /// The optimal tag sequence as indices.
    pub fn decode(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        start: &[f32],
        end: &[f32],
    ) -> Result<Vec<usize>> {
        let seq_len = emission_scores.len();
        if seq_len == 0 {
            return Ok(Vec::new());
        }

        let n = self.num_tags;
        if emission_scores.iter().any(|row| row.len() != n)
            || transition_matrix.len() != n
            || transition_matrix.iter().any(|row| row.len() != n)
            || start.len() != n
            || end.len() != n
        {
            return Err(KariError::Decode(format!(
                "score dimension mismatch: expected {n} tags"
            )));
        }

        let mut dp: Vec<Vec<f32>> = vec![vec![f32::NEG_INFINITY; n]; seq_len];
        let mut backptr: Vec<Vec<usize>> = vec![vec![0; n]; seq_len];

        for tag in 0..n {
            dp[0][tag] = start[tag] + emission_scores[0][tag];
        }

        for pos in 1..seq_len {
            for curr_tag in 0..n {
                let mut best_score = f32::NEG_INFINITY;
                let mut best_prev = 0;

                for prev_tag in 0..n {
                    let score = dp[pos - 1][prev_tag] + transition_matrix[prev_tag][curr_tag];
                    if score > best_score {
                        best_score = score;
                        best_prev = prev_tag;
                    }
                }

                dp[pos][curr_tag] = best_score + emission_scores[pos][curr_tag];
                backptr[pos][curr_tag] = best_prev;
            }
        }

        let mut best_final_tag = 0;
        let mut best_final_score = f32::NEG_INFINITY;
        for tag in 0..n {
            let score = dp[seq_len - 1][tag] + end[tag];
            if score > best_final_score {
                best_final_score = score;
                best_final_tag = tag;
            }
        }

        let mut path = Vec::with_capacity(seq_len);
        path.push(best_final_tag);
        let mut curr_tag = best_final_tag;
        for pos in (1..seq_len).rev() {
            curr_tag = backptr[pos][curr_tag];
            path.push(curr_tag);
        }

        path.reverse();
        Ok(path)
    }

    /// Score of a given path, mirroring the terms `decode` maximises.
    pub fn path_score(
        &self,
        path: &[usize],
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
        start: &[f32],
        end: &[f32],
    ) -> Result<f32> {
        let (Some(&first), Some(&last)) = (path.first(), path.last()) else {
            return Ok(0.0);
        };
        if path.len() != emission_scores.len() || path.iter().any(|&t| t >= self.num_tags) {
            return Err(KariError::Decode(format!(
                "path of length {} does not fit {} positions of {} tags",
                path.len(),
                emission_scores.len(),
                self.num_tags
            )));
        }

        let mut score = start[first] + end[last];
        for (pos, &tag) in path.iter().enumerate() {
            score += emission_scores[pos][tag];
            if pos > 0 {
                score += transition_matrix[path[pos - 1]][tag];
            }
        }
        Ok(score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros(n: usize) -> (Vec<Vec<f32>>, Vec<f32>, Vec<f32>) {
        (vec![vec![0.0; n]; n], vec![0.0; n], vec![0.0; n])
    }

    #[test]
    fn test_viterbi_follows_emissions() {
        let decoder = ViterbiDecoder::new(3);
        let (transition, start, end) = zeros(3);
        let emissions = vec![vec![1.0, 0.0, 0.0], vec![0.0, 0.0, 1.0], vec![0.0, 1.0, 0.0]];

        let result = decoder.decode(&emissions, &transition, &start, &end).unwrap();
        assert_eq!(result, vec![0, 2, 1]);
    }

    #[test]
    fn test_viterbi_empty() {
        let decoder = ViterbiDecoder::new(3);
        let (transition, start, end) = zeros(3);
        let emissions: Vec<Vec<f32>> = vec![];

        let result = decoder.decode(&emissions, &transition, &start, &end).unwrap();
        assert!(result.is_empty());
    }

    #[test]
    fn test_transitions_override_weak_emissions() {
        let decoder = ViterbiDecoder::new(2);
        // 0 -> 1 is heavily penalised
        let transition = vec![vec![0.0, -10.0], vec![0.0, 0.0]];
        let emissions = vec![vec![2.0, 0.0], vec![0.0, 1.0]];

        let result = decoder
            .decode(&emissions, &transition, &[0.0, 0.0], &[0.0, 0.0])
            .unwrap();
        assert_eq!(result, vec![0, 0]);
    }

    #[test]
    fn test_boundaries_are_scored() {
        let decoder = ViterbiDecoder::new(2);
        let (transition, _, _) = zeros(2);
        let emissions = vec![vec![1.0, 0.0]];

        let result = decoder
            .decode(&emissions, &transition, &[0.0, 5.0], &[0.0, 0.0])
            .unwrap();
        assert_eq!(result, vec![1]);
    }

    #[test]
    fn test_decoded_path_is_optimal() {
        let decoder = ViterbiDecoder::new(3);
        let transition = vec![
            vec![0.5, -0.2, 0.1],
            vec![-0.3, 0.4, 0.0],
            vec![0.2, 0.1, -0.5],
        ];
        let start = vec![0.1, -0.1, 0.3];
        let end = vec![-0.2, 0.2, 0.0];
        let emissions = vec![
            vec![0.3, 0.1, 0.2],
            vec![0.0, 0.9, 0.1],
            vec![0.4, 0.2, 0.3],
        ];

        let best = decoder.decode(&emissions, &transition, &start, &end).unwrap();
        let best_score = decoder
            .path_score(&best, &emissions, &transition, &start, &end)
            .unwrap();

        for a in 0..3 {
            for b in 0..3 {
                for c in 0..3 {
                    let score = decoder
                        .path_score(&[a, b, c], &emissions, &transition, &start, &end)
                        .unwrap();
                    assert!(score <= best_score + 1e-6);
                }
            }
        }
    }

    #[test]
    fn test_dimension_mismatch() {
        let decoder = ViterbiDecoder::new(3);
        let (transition, start, end) = zeros(3);
        let emissions = vec![vec![1.0, 0.0]];
        assert!(matches!(
            decoder.decode(&emissions, &transition, &start, &end),
            Err(KariError::Decode(_))
        ));
    }

    #[test]
    fn test_path_score_rejects_foreign_tags() {
        let decoder = ViterbiDecoder::new(2);
        let (transition, start, end) = zeros(2);
        let emissions = vec![vec![0.0, 0.0]; 2];
        let err = decoder
            .path_score(&[0, 5], &emissions, &transition, &start, &end)
            .unwrap_err();
        assert!(matches!(err, KariError::Decode(_)));
        assert!(err.to_string().starts_with("decode error"));
    }
}
