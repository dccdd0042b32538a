// =============================================================================
// Impact math — from provider sentiment to news-score contribution
// =============================================================================

use crate::types::clip;

/// Per-article impact bound.
pub const IMPACT_CLIP: f64 = 25.0;

/// Turn a provider sentiment and a constituent weight into the pair
/// (weighted contribution, clipped impact).
///
/// impact = clip(sentiment x weight x 100, +/-25)
pub fn compute_impact(sentiment: f64, weight: f64) -> (f64, f64) {
    let weighted = sentiment * weight;
    let impact = clip(weighted * 100.0, -IMPACT_CLIP, IMPACT_CLIP);
    (weighted, impact)
}

/// The minute analyzer's aggregation rule over one minute's new articles:
/// mean of the weighted contributions (on the x100 impact scale), clipped to
/// +/-25. Averaging normalises for volume so a busy headline day does not win
/// on count alone. The composer, by contrast, adds per-article impacts
/// directly and clips the running news score to +/-100; both rules share this
/// scale.
pub fn mean_new_article_contribution(weighted_contributions: &[f64]) -> f64 {
    if weighted_contributions.is_empty() {
        return 0.0;
    }
    let mean =
        weighted_contributions.iter().sum::<f64>() * 100.0 / weighted_contributions.len() as f64;
    clip(mean, -IMPACT_CLIP, IMPACT_CLIP)
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constituent_impact_matches_weight_scale() {
        // sentiment +0.9 on a 0.14-weight constituent.
        let (weighted, impact) = compute_impact(0.9, 0.14);
        assert!((weighted - 0.126).abs() < 1e-12);
        assert!((impact - 12.6).abs() < 1e-9);
    }

    #[test]
    fn strong_market_story_clips_at_25() {
        let (_, impact) = compute_impact(1.0, 0.30);
        assert!((impact - 25.0).abs() < 1e-9);

        let (_, impact) = compute_impact(-1.0, 0.30);
        assert!((impact + 25.0).abs() < 1e-9);
    }

    #[test]
    fn small_weight_stays_inside_bounds() {
        let (_, impact) = compute_impact(0.5, 0.03);
        assert!((impact - 1.5).abs() < 1e-9);
    }

    #[test]
    fn mean_contribution_averages_then_clips() {
        // Two articles: 0.9 x 0.14 and -0.2 x 0.30.
        let mean = mean_new_article_contribution(&[0.126, -0.06]);
        assert!((mean - 3.3).abs() < 1e-9);

        // A stack of maximal stories still averages to the clip, not above.
        let mean = mean_new_article_contribution(&[0.9, 0.9, 0.9]);
        assert!((mean - 25.0).abs() < 1e-9);

        assert_eq!(mean_new_article_contribution(&[]), 0.0);
    }
}
