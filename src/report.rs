use std::fmt::Write;

use crate::models::{EvaluationResult, PipelineStatus, TrainingRun};

/// Families ordered by test F1, best first. Equal scores keep name order.
pub fn rank_by_f1(run: &TrainingRun) -> Vec<(&str, &EvaluationResult)> {
    let mut ranked: Vec<(&str, &EvaluationResult)> = run
        .results
        .iter()
        .map(|(name, result)| (name.as_str(), result))
        .collect();
    ranked.sort_by(|a, b| b.1.f1.total_cmp(&a.1.f1));
    ranked
}

pub fn build_report(run: &TrainingRun, status: &PipelineStatus) -> String {
    let mut output = String::new();

    let _ = writeln!(output, "# No-Show Model Training Report");
    let _ = writeln!(
        output,
        "Run {} completed {}",
        run.run_id,
        run.completed_at.format("%Y-%m-%d %H:%M:%S UTC")
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Pipeline Status");
    let _ = writeln!(output, "- State: {:?}", status.status);
    if let Some(start) = status.start_time {
        let _ = writeln!(output, "- Started: {}", start.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(end) = status.end_time {
        let _ = writeln!(output, "- Finished: {}", end.format("%Y-%m-%d %H:%M:%S"));
    }
    if let Some(error) = &status.error {
        let _ = writeln!(output, "- Error: {error}");
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Model Comparison");

    let ranked = rank_by_f1(run);
    if ranked.is_empty() {
        let _ = writeln!(output, "No model families were evaluated.");
    } else {
        let _ = writeln!(output, "| Model | F1 | Precision | Recall | Accuracy | CV F1 |");
        let _ = writeln!(output, "|---|---|---|---|---|---|");
        for (name, result) in &ranked {
            let marker = if *name == run.best_model { " (selected)" } else { "" };
            let _ = writeln!(
                output,
                "| {}{} | {:.4} | {:.4} | {:.4} | {:.4} | {:.4} |",
                name,
                marker,
                result.f1,
                result.precision,
                result.recall,
                result.accuracy,
                result.cv_score
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Selected Model");

    match run.best() {
        None => {
            let _ = writeln!(output, "No model was selected.");
        }
        Some(best) => {
            let [[tn, fp], [fn_, tp]] = best.confusion_matrix;
            let _ = writeln!(output, "{}", run.best_model);
            let _ = writeln!(output);
            let _ = writeln!(output, "| | Predicted attended | Predicted no-show |");
            let _ = writeln!(output, "|---|---|---|");
            let _ = writeln!(output, "| Attended | {tn} | {fp} |");
            let _ = writeln!(output, "| No-show | {fn_} | {tp} |");
            let _ = writeln!(output);
            let params = serde_json::to_string(&best.best_params).unwrap_or_default();
            let _ = writeln!(output, "Parameters: `{params}`");
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::classifier::ModelParams;

    fn result(f1: f64) -> EvaluationResult {
        EvaluationResult {
            best_params: ModelParams::LogisticRegression { c: 1.0, max_iter: 100 },
            accuracy: 0.7,
            precision: 0.6,
            recall: 0.5,
            f1,
            confusion_matrix: [[50, 10], [8, 12]],
            cv_score: 0.55,
        }
    }

    fn run() -> TrainingRun {
        let mut results = BTreeMap::new();
        results.insert("DecisionTree".to_string(), result(0.41));
        results.insert("LogisticRegression".to_string(), result(0.52));
        results.insert("RandomForest".to_string(), result(0.47));
        TrainingRun {
            run_id: Uuid::new_v4(),
            results,
            best_model: "LogisticRegression".to_string(),
            completed_at: Utc::now(),
        }
    }

    #[test]
    fn ranks_families_by_f1() {
        let run = run();
        let names: Vec<&str> = rank_by_f1(&run).into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, ["LogisticRegression", "RandomForest", "DecisionTree"]);
    }

    #[test]
    fn report_lists_metrics_and_matrix() {
        let now = Utc::now();
        let status = PipelineStatus::running(now).completed(now);
        let report = build_report(&run(), &status);

        assert!(report.starts_with("# No-Show Model Training Report"));
        assert!(report.contains("| LogisticRegression (selected) | 0.5200 |"));
        assert!(report.contains("| No-show | 8 | 12 |"));
        assert!(report.contains("\"family\":\"LogisticRegression\""));
        assert!(report.contains("- State: Completed"));
    }

    #[test]
    fn failed_status_shows_the_error() {
        let status = PipelineStatus::running(Utc::now()).failed(Utc::now(), "load stage failed");
        let report = build_report(&run(), &status);
        assert!(report.contains("- Error: load stage failed"));
    }
}
