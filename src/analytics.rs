// Analytics over the full expense set
// Anomaly flagging, monthly trend forecast and spending summary; all pure and in-memory

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::db::Expense;

/// Deviation threshold in population standard deviations
pub const ANOMALY_SIGMA: f64 = 2.0;

/// Relative slack on the 2σ boundary so rounding cannot flip a result
const BOUNDARY_TOLERANCE: f64 = 1e-9;

/// Spread below this fraction of |mean| is treated as no spread at all
const ZERO_SPREAD_RATIO: f64 = 1e-12;

/// Round to two decimal places for money-like output
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

// ============================================================================
// ANOMALY DETECTION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub id: i64,
    pub title: String,
    pub amount: f64,
}

/// Mean and population standard deviation, or None for an empty slice
pub fn mean_and_std(values: &[f64]) -> Option<(f64, f64)> {
    if values.is_empty() {
        return None;
    }

    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let variance = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;

    Some((mean, variance.sqrt()))
}

/// Flag expenses at least two standard deviations from the mean.
///
/// Fewer than two expenses or zero spread yields no anomalies.
pub fn detect_anomalies(expenses: &[Expense]) -> Vec<Anomaly> {
    if expenses.len() < 2 {
        return Vec::new();
    }

    let amounts: Vec<f64> = expenses.iter().map(|e| e.amount).collect();
    let (mean, std) = match mean_and_std(&amounts) {
        Some(stats) => stats,
        None => return Vec::new(),
    };

    if !std.is_finite() || std <= mean.abs() * ZERO_SPREAD_RATIO {
        return Vec::new();
    }

    let threshold = ANOMALY_SIGMA * std * (1.0 - BOUNDARY_TOLERANCE);

    expenses
        .iter()
        .filter(|e| (e.amount - mean).abs() >= threshold)
        .map(|e| Anomaly {
            id: e.id,
            title: e.title.clone(),
            amount: e.amount,
        })
        .collect()
}

// ============================================================================
// FORECASTING
// ============================================================================

/// Sum amounts per calendar month (`YYYY-MM`), chronologically ordered
pub fn monthly_totals(expenses: &[Expense]) -> Vec<(String, f64)> {
    let mut months: BTreeMap<String, f64> = BTreeMap::new();

    for e in expenses {
        *months
            .entry(e.created_at.format("%Y-%m").to_string())
            .or_insert(0.0) += e.amount;
    }

    months.into_iter().collect()
}

/// Ordinary least squares over (0..n, values); returns (slope, intercept)
pub fn linear_fit(values: &[f64]) -> Option<(f64, f64)> {
    if values.len() < 2 {
        return None;
    }

    let n = values.len() as f64;
    let mean_x = (n - 1.0) / 2.0;
    let mean_y = values.iter().sum::<f64>() / n;

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (i, y) in values.iter().enumerate() {
        let dx = i as f64 - mean_x;
        sxy += dx * (y - mean_y);
        sxx += dx * dx;
    }

    let slope = sxy / sxx;
    Some((slope, mean_y - slope * mean_x))
}

/// Predict next month's total for the given expenses (one category)
pub fn forecast_next_month(expenses: &[Expense]) -> f64 {
    let totals: Vec<f64> = monthly_totals(expenses)
        .into_iter()
        .map(|(_, total)| total)
        .collect();

    match totals.len() {
        0 => 0.0,
        1 => round2(totals[0]),
        n => match linear_fit(&totals) {
            Some((slope, intercept)) => round2(slope * n as f64 + intercept),
            None => 0.0,
        },
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub forecast: f64,
}

// ============================================================================
// SUMMARY
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    pub total_spent: f64,
    pub top_category: String,
    pub top_category_amount: f64,
}

/// Total spend plus the category with the highest total.
///
/// Ties go to the alphabetically first category.
pub fn personalized_summary(expenses: &[Expense]) -> Summary {
    let mut by_category: BTreeMap<&str, f64> = BTreeMap::new();
    let mut total = 0.0;

    for e in expenses {
        total += e.amount;
        *by_category.entry(e.category.as_str()).or_insert(0.0) += e.amount;
    }

    let mut top: Option<(&str, f64)> = None;
    for (category, amount) in by_category {
        match top {
            Some((_, best)) if amount <= best => {}
            _ => top = Some((category, amount)),
        }
    }

    let (top_category, top_amount) = top.unwrap_or(("", 0.0));

    Summary {
        total_spent: round2(total),
        top_category: top_category.to_string(),
        top_category_amount: round2(top_amount),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn expense(id: i64, amount: f64, category: &str, year: i32, month: u32) -> Expense {
        Expense {
            id,
            title: format!("item {}", id),
            amount,
            category: category.to_string(),
            created_at: Utc.with_ymd_and_hms(year, month, 10, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn test_single_outlier_flagged() {
        let expenses: Vec<Expense> = [10.0, 10.0, 10.0, 10.0, 1000.0]
            .iter()
            .enumerate()
            .map(|(i, a)| expense(i as i64 + 1, *a, "Misc", 2024, 1))
            .collect();

        let anomalies = detect_anomalies(&expenses);

        assert_eq!(anomalies.len(), 1);
        assert_eq!(anomalies[0].id, 5);
        assert_eq!(anomalies[0].amount, 1000.0);
    }

    #[test]
    fn test_single_outlier_flagged_at_any_scale() {
        for amounts in [
            [0.1, 0.1, 0.1, 0.1, 0.2],
            [1.1, 1.1, 1.1, 1.1, 2.2],
            [10.0, 10.0, 10.0, 10.0, 1000.0],
            [0.03, 0.03, 0.03, 0.03, 7.77],
        ] {
            let expenses: Vec<Expense> = amounts
                .iter()
                .enumerate()
                .map(|(i, a)| expense(i as i64 + 1, *a, "Misc", 2024, 1))
                .collect();

            let anomalies = detect_anomalies(&expenses);

            assert_eq!(anomalies.len(), 1, "amounts {:?}", amounts);
            assert_eq!(anomalies[0].id, 5, "amounts {:?}", amounts);
        }
    }

    #[test]
    fn test_uniform_decimals_have_no_anomalies() {
        let uniform: Vec<Expense> = (1..=7).map(|i| expense(i, 0.1, "Food", 2024, 1)).collect();
        assert!(detect_anomalies(&uniform).is_empty());
    }

    #[test]
    fn test_uniform_and_tiny_sets_have_no_anomalies() {
        let uniform: Vec<Expense> = (1..=4).map(|i| expense(i, 25.0, "Food", 2024, 1)).collect();
        assert!(detect_anomalies(&uniform).is_empty());

        assert!(detect_anomalies(&[]).is_empty());
        assert!(detect_anomalies(&[expense(1, 99.0, "Food", 2024, 1)]).is_empty());
    }

    #[test]
    fn test_mean_and_std() {
        let (mean, std) = mean_and_std(&[2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0]).unwrap();
        assert_eq!(mean, 5.0);
        assert_eq!(std, 2.0);
        assert!(mean_and_std(&[]).is_none());
    }

    #[test]
    fn test_forecast_edge_cases() {
        assert_eq!(forecast_next_month(&[]), 0.0);

        let one_month = vec![
            expense(1, 20.0, "Food", 2024, 3),
            expense(2, 30.0, "Food", 2024, 3),
        ];
        assert_eq!(forecast_next_month(&one_month), 50.0);
    }

    #[test]
    fn test_forecast_follows_linear_trend() {
        let two_months = vec![
            expense(1, 100.0, "Food", 2024, 1),
            expense(2, 200.0, "Food", 2024, 2),
        ];
        let forecast = forecast_next_month(&two_months);
        assert!(forecast > 200.0);
        assert_eq!(forecast, 300.0);

        // Months are ordered by calendar, not insertion
        let shuffled = vec![
            expense(1, 30.0, "Food", 2024, 3),
            expense(2, 10.0, "Food", 2023, 12),
            expense(3, 20.0, "Food", 2024, 1),
        ];
        assert_eq!(forecast_next_month(&shuffled), 40.0);
    }

    #[test]
    fn test_forecast_rounds_to_cents() {
        let months = vec![
            expense(1, 10.0, "Food", 2024, 1),
            expense(2, 10.0, "Food", 2024, 2),
            expense(3, 10.333, "Food", 2024, 3),
        ];
        let forecast = forecast_next_month(&months);
        assert_eq!(forecast, round2(forecast));
    }

    #[test]
    fn test_monthly_totals() {
        let expenses = vec![
            expense(1, 5.0, "Food", 2024, 2),
            expense(2, 7.5, "Food", 2024, 1),
            expense(3, 2.5, "Food", 2024, 2),
        ];

        assert_eq!(
            monthly_totals(&expenses),
            vec![("2024-01".to_string(), 7.5), ("2024-02".to_string(), 7.5)]
        );
    }

    #[test]
    fn test_summary_empty() {
        assert_eq!(
            personalized_summary(&[]),
            Summary {
                total_spent: 0.0,
                top_category: String::new(),
                top_category_amount: 0.0,
            }
        );
    }

    #[test]
    fn test_summary_top_category() {
        let expenses = vec![
            expense(1, 10.111, "Food", 2024, 1),
            expense(2, 50.0, "Rent", 2024, 1),
            expense(3, 45.0, "Food", 2024, 2),
            expense(4, 3.0, "Transport", 2024, 2),
        ];

        let summary = personalized_summary(&expenses);

        assert_eq!(summary.total_spent, 108.11);
        assert_eq!(summary.top_category, "Food");
        assert_eq!(summary.top_category_amount, 55.11);
    }

    #[test]
    fn test_summary_tie_goes_to_first_category() {
        let expenses = vec![
            expense(1, 20.0, "Travel", 2024, 1),
            expense(2, 20.0, "Books", 2024, 1),
        ];

        assert_eq!(personalized_summary(&expenses).top_category, "Books");
    }
}
