//! # Binary-classification metrics per predictor
//!
//! Each predictor column is compared against a ground-truth label column. A predictor
//! value counts as a positive call when it equals `true` (ignoring case); the truth is
//! positive when the label equals the configured pathogenic category exactly. Rows with an
//! empty predictor value are left out of that predictor's counts entirely.
//!
//! Ratios whose denominator is zero are undefined and reported as `None`, never as a
//! panic or a silent zero. In the persisted table they are written as `NaN`.

use crate::table::{KeyedTable, TableError};
use log::debug;

pub const PREDICTOR_FIELD: &str = "Predictor";
pub const METRIC_FIELDS: [&str; 8] = ["TP", "TN", "FP", "FN", "Precision", "Recall", "F-score", "MCC"];
const UNDEFINED: &str = "NaN";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfusionMatrix {
    pub tp: u64,
    pub tn: u64,
    pub fp: u64,
    pub fn_: u64,
}

fn ratio(numerator: f64, denominator: f64) -> Option<f64> {
    (denominator != 0.0).then(|| numerator / denominator)
}

impl ConfusionMatrix {
    pub fn record(&mut self, truth: bool, predicted: bool) {
        match (truth, predicted) {
            (true, true) => self.tp += 1,
            (true, false) => self.fn_ += 1,
            (false, true) => self.fp += 1,
            (false, false) => self.tn += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.tp + self.tn + self.fp + self.fn_
    }

    /// `TP / (TP + FP)`; undefined when nothing was called positive.
    pub fn precision(&self) -> Option<f64> {
        ratio(self.tp as f64, (self.tp + self.fp) as f64)
    }

    /// `TP / (TP + FN)`; undefined when there are no positive labels.
    pub fn recall(&self) -> Option<f64> {
        ratio(self.tp as f64, (self.tp + self.fn_) as f64)
    }

    /// `2PR / (P + R)`; undefined when either side is, or when both are zero.
    pub fn f_score(&self) -> Option<f64> {
        let (p, r) = (self.precision()?, self.recall()?);
        ratio(2.0 * p * r, p + r)
    }

    /// Matthews correlation coefficient; undefined when any marginal is empty.
    pub fn mcc(&self) -> Option<f64> {
        let (tp, tn, fp, fn_) = (
            self.tp as f64,
            self.tn as f64,
            self.fp as f64,
            self.fn_ as f64,
        );
        let denominator = ((tp + fp) * (tp + fn_) * (tn + fp) * (tn + fn_)).sqrt();
        ratio(tp * tn - fp * fn_, denominator)
    }
}

/// The statistics for one predictor.
#[derive(Debug, Clone, PartialEq)]
pub struct PredictorScore {
    pub predictor: String,
    pub matrix: ConfusionMatrix,
    pub precision: Option<f64>,
    pub recall: Option<f64>,
    pub f_score: Option<f64>,
    pub mcc: Option<f64>,
}

impl PredictorScore {
    pub fn from_matrix(predictor: &str, matrix: ConfusionMatrix) -> Self {
        Self {
            predictor: predictor.to_string(),
            matrix,
            precision: matrix.precision(),
            recall: matrix.recall(),
            f_score: matrix.f_score(),
            mcc: matrix.mcc(),
        }
    }

    /// Values in `METRIC_FIELDS` order.
    pub fn values(&self) -> [Option<f64>; 8] {
        [
            Some(self.matrix.tp as f64),
            Some(self.matrix.tn as f64),
            Some(self.matrix.fp as f64),
            Some(self.matrix.fn_ as f64),
            self.precision,
            self.recall,
            self.f_score,
            self.mcc,
        ]
    }
}

/// The evaluation table: one row per predictor, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub scores: Vec<PredictorScore>,
}

impl Evaluation {
    pub fn get(&self, predictor: &str) -> Option<&PredictorScore> {
        self.scores.iter().find(|s| s.predictor == predictor)
    }

    pub fn to_table(&self) -> Result<KeyedTable, TableError> {
        let mut table = KeyedTable::new(
            PREDICTOR_FIELD,
            METRIC_FIELDS.iter().map(|f| f.to_string()).collect(),
        )?;
        for score in &self.scores {
            let m = score.matrix;
            let counts = [m.tp, m.tn, m.fp, m.fn_].map(|c| c.to_string());
            let ratios = [score.precision, score.recall, score.f_score, score.mcc].map(|v| {
                v.map_or_else(|| UNDEFINED.to_string(), |x| x.to_string())
            });
            table.push_row(
                score.predictor.clone(),
                counts.into_iter().chain(ratios).collect(),
            )?;
        }
        Ok(table)
    }

    /// Rebuilds an evaluation from its table form. Ratios are recomputed from the counts.
    pub fn from_table(table: &KeyedTable) -> Result<Self, TableError> {
        let mut scores = Vec::with_capacity(table.len());
        for (predictor, record) in table.iter() {
            let count = |field: &str| -> Result<u64, TableError> {
                let raw = record
                    .get(field)
                    .ok_or_else(|| TableError::UnknownField(field.to_string()))?;
                raw.parse::<u64>().map_err(|_| TableError::UnknownField(format!(
                    "{field} (value '{raw}' for '{predictor}' is not a count)"
                )))
            };
            let matrix = ConfusionMatrix {
                tp: count("TP")?,
                tn: count("TN")?,
                fp: count("FP")?,
                fn_: count("FN")?,
            };
            scores.push(PredictorScore::from_matrix(predictor, matrix));
        }
        Ok(Self { scores })
    }
}

/// Scores predictor columns of a sample-keyed table against its label column.
#[derive(Debug, Clone)]
pub struct MetricsEngine {
    label_field: String,
    positive_label: String,
    excluded: Vec<String>,
}

impl MetricsEngine {
    pub fn new(label_field: &str, positive_label: &str, excluded: &[String]) -> Self {
        Self {
            label_field: label_field.to_string(),
            positive_label: positive_label.to_string(),
            excluded: excluded.to_vec(),
        }
    }

    pub fn confusion(&self, table: &KeyedTable, predictor: &str) -> Result<ConfusionMatrix, TableError> {
        let labels = table.column(&self.label_field)?;
        let calls = table.column(predictor)?;

        let mut matrix = ConfusionMatrix::default();
        let mut skipped = 0usize;
        for (label, call) in labels.into_iter().zip(calls) {
            if call.is_empty() {
                skipped += 1;
                continue;
            }
            matrix.record(label == self.positive_label, call.eq_ignore_ascii_case("true"));
        }
        if skipped > 0 {
            debug!("{predictor}: {skipped} rows without a call were left out");
        }
        Ok(matrix)
    }

    /// Evaluates each listed predictor that is not excluded, in the given order.
    pub fn evaluate<S: AsRef<str>>(
        &self,
        table: &KeyedTable,
        predictors: &[S],
    ) -> Result<Evaluation, TableError> {
        let mut scores = Vec::with_capacity(predictors.len());
        for predictor in predictors {
            let predictor = predictor.as_ref();
            if predictor == self.label_field || self.excluded.iter().any(|e| e == predictor) {
                continue;
            }
            let matrix = self.confusion(table, predictor)?;
            scores.push(PredictorScore::from_matrix(predictor, matrix));
        }
        Ok(Evaluation { scores })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn labelled(rows: &[(&str, &str, &str)]) -> KeyedTable {
        let mut table = KeyedTable::new(
            "Num",
            vec!["PATHOGENICITY".to_string(), "SIFT_pred".to_string()],
        )
        .unwrap();
        for (key, label, call) in rows {
            table
                .push_row(*key, vec![label.to_string(), call.to_string()])
                .unwrap();
        }
        table
    }

    fn scenario() -> KeyedTable {
        let mut rows = Vec::new();
        let mut push = |label: &'static str, call: &'static str, n: usize| {
            for _ in 0..n {
                rows.push((label, call));
            }
        };
        push("PATHOGENIC", "true", 3);
        push("PATHOGENIC", "false", 1);
        push("BENIGN", "TRUE", 1);
        push("BENIGN", "false", 5);
        push("BENIGN", "", 2);

        let keys: Vec<String> = (0..rows.len()).map(|i| i.to_string()).collect();
        let owned: Vec<(&str, &str, &str)> = keys
            .iter()
            .zip(&rows)
            .map(|(k, (l, c))| (k.as_str(), *l, *c))
            .collect();
        labelled(&owned)
    }

    #[test]
    fn confusion_matrix_and_statistics_for_reference_scenario() {
        let engine = MetricsEngine::new("PATHOGENICITY", "PATHOGENIC", &[]);
        let evaluation = engine.evaluate(&scenario(), &["SIFT_pred"]).unwrap();
        let score = evaluation.get("SIFT_pred").unwrap();

        assert_eq!(
            score.matrix,
            ConfusionMatrix {
                tp: 3,
                tn: 5,
                fp: 1,
                fn_: 1
            }
        );
        assert_relative_eq!(score.precision.unwrap(), 0.75);
        assert_relative_eq!(score.recall.unwrap(), 0.75);
        assert_relative_eq!(score.f_score.unwrap(), 0.75);
        // (3*5 - 1*1) / sqrt(4 * 4 * 6 * 6)
        assert_relative_eq!(score.mcc.unwrap(), 14.0 / 24.0, epsilon = 1e-12);
    }

    #[test]
    fn zero_denominators_are_undefined() {
        let never_positive = ConfusionMatrix {
            tp: 0,
            tn: 4,
            fp: 0,
            fn_: 2,
        };
        assert_eq!(never_positive.precision(), None);
        assert_eq!(never_positive.recall(), Some(0.0));
        assert_eq!(never_positive.f_score(), None);
        assert_eq!(never_positive.mcc(), None);

        let all_wrong = ConfusionMatrix {
            tp: 0,
            tn: 0,
            fp: 3,
            fn_: 2,
        };
        assert_eq!(all_wrong.precision(), Some(0.0));
        assert_eq!(all_wrong.recall(), Some(0.0));
        assert_eq!(all_wrong.f_score(), None);
    }

    #[test]
    fn excluded_predictors_and_label_are_skipped() {
        let engine = MetricsEngine::new("PATHOGENICITY", "PATHOGENIC", &["SIFT_pred".to_string()]);
        let evaluation = engine
            .evaluate(&scenario(), &["PATHOGENICITY", "SIFT_pred"])
            .unwrap();
        assert!(evaluation.scores.is_empty());
    }

    #[test]
    fn unknown_predictor_is_an_error() {
        let engine = MetricsEngine::new("PATHOGENICITY", "PATHOGENIC", &[]);
        assert!(matches!(
            engine.evaluate(&scenario(), &["Nope"]),
            Err(TableError::UnknownField(_))
        ));
    }

    #[test]
    fn label_match_is_exact() {
        let table = labelled(&[("1", "pathogenic", "true"), ("2", "PATHOGENIC", "true")]);
        let engine = MetricsEngine::new("PATHOGENICITY", "PATHOGENIC", &[]);
        let matrix = engine.confusion(&table, "SIFT_pred").unwrap();
        assert_eq!(matrix.tp, 1);
        assert_eq!(matrix.fp, 1);
    }

    #[test]
    fn table_form_round_trips_and_marks_undefined() {
        let evaluation = Evaluation {
            scores: vec![
                PredictorScore::from_matrix(
                    "REVEL",
                    ConfusionMatrix {
                        tp: 3,
                        tn: 5,
                        fp: 1,
                        fn_: 1,
                    },
                ),
                PredictorScore::from_matrix(
                    "Silent",
                    ConfusionMatrix {
                        tp: 0,
                        tn: 7,
                        fp: 0,
                        fn_: 0,
                    },
                ),
            ],
        };
        let table = evaluation.to_table().unwrap();
        assert_eq!(table.get("REVEL", "Precision"), Some("0.75"));
        assert_eq!(table.get("Silent", "MCC"), Some("NaN"));
        assert_eq!(Evaluation::from_table(&table).unwrap(), evaluation);
    }
}
