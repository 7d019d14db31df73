// ========================================================================================
//                           Benchmarking-event JSON documents
// ========================================================================================
//
// The evaluation is published as one benchmarking-event document (participants, one
// assessment per participant and metric, a Precision/Recall aggregation and the challenge
// record) plus a descriptor file per tool and per metric. Undefined metrics become `null`.

use crate::config::ExportConfig;
use crate::metrics::{Evaluation, METRIC_FIELDS};
use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const EVENT_FILE: &str = "benchmarking_event.json";
const TOOL_SCHEMA: &str = "https://www.elixir-europe.org/excelerate/WP2/json-schemas/1.0/Tool";
const METRIC_SCHEMA: &str = "https://www.elixir-europe.org/excelerate/WP2/json-schemas/1.0/Metrics";
const AGGREGATION_X: &str = "Precision";
const AGGREGATION_Y: &str = "Recall";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error writing '{path}': {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Participant {
    #[serde(rename = "_id")]
    pub id: String,
    pub challenge_id: Vec<String>,
    pub community_id: String,
    pub datalink: ParticipantLink,
    pub participant_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParticipantLink {
    pub attrs: Vec<&'static str>,
    pub status: &'static str,
    pub validation_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Assessment {
    #[serde(rename = "_id")]
    pub id: String,
    pub challenge_id: String,
    pub community_id: String,
    pub metrics: MetricValue,
    pub participant_id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricValue {
    pub metric_id: String,
    pub value: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Aggregation {
    #[serde(rename = "_id")]
    pub id: String,
    pub challenge_ids: Vec<String>,
    pub community_id: String,
    pub datalink: AggregationLink,
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregationLink {
    pub inline_data: InlineData,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InlineData {
    pub challenge_participants: Vec<PlotPoint>,
    pub visualization: Visualization,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlotPoint {
    pub metric_x: Option<f64>,
    pub metric_y: Option<f64>,
    pub participant_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Visualization {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub x_axis: &'static str,
    pub y_axis: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Challenge {
    pub id: String,
    pub benchmarking_event_id: String,
    pub participants: Vec<String>,
}

/// One entry of the benchmarking-event array.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum EventRecord {
    Participant(Participant),
    Assessment(Assessment),
    Aggregation(Aggregation),
    Challenge(Challenge),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDescriptor {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_schema")]
    pub schema: &'static str,
    pub community_ids: Vec<String>,
    pub name: String,
    pub description: String,
    pub is_automated: bool,
    pub tool_contact_ids: Vec<String>,
    pub status: &'static str,
    pub references: Vec<String>,
    pub tool_access: Vec<ToolAccess>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolAccess {
    pub tool_access_type: &'static str,
    pub link: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricDescriptor {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(rename = "_schema")]
    pub schema: &'static str,
    pub title: String,
    pub metrics_contact_ids: Vec<String>,
}

/// `SIFT_pred` → `SIFT_P`.
pub fn participant_id(predictor: &str) -> String {
    predictor.replacen("_pred", "_P", 1)
}

/// `SIFT_pred` → `SIFT`.
pub fn tool_id(predictor: &str) -> String {
    predictor.replacen("_pred", "", 1)
}

pub fn benchmarking_event(
    evaluation: &Evaluation,
    config: &ExportConfig,
    validation_date: DateTime<Utc>,
) -> Vec<EventRecord> {
    let community = &config.community_id;
    let challenge = &config.challenge_id;
    let participants: Vec<String> = evaluation
        .scores
        .iter()
        .map(|s| participant_id(&s.predictor))
        .collect();

    let mut records: Vec<EventRecord> = participants
        .iter()
        .map(|participant| {
            EventRecord::Participant(Participant {
                id: format!("{community}:{participant}"),
                challenge_id: vec![challenge.clone()],
                community_id: community.clone(),
                datalink: ParticipantLink {
                    attrs: vec!["archive"],
                    status: "ok",
                    validation_date,
                },
                participant_id: participant.clone(),
                kind: "participant",
            })
        })
        .collect();

    for (i, metric) in METRIC_FIELDS.iter().enumerate() {
        for (participant, score) in participants.iter().zip(&evaluation.scores) {
            records.push(EventRecord::Assessment(Assessment {
                id: format!("{community}:{challenge}_{participant}_{metric}_A"),
                challenge_id: challenge.clone(),
                community_id: community.clone(),
                metrics: MetricValue {
                    metric_id: metric.to_string(),
                    value: score.values()[i],
                },
                participant_id: participant.clone(),
                kind: "assessment",
            }));
        }
    }

    records.push(EventRecord::Aggregation(Aggregation {
        id: format!("{community}:{challenge}_agg_{AGGREGATION_X}+{AGGREGATION_Y}"),
        challenge_ids: vec![challenge.clone()],
        community_id: community.clone(),
        datalink: AggregationLink {
            inline_data: InlineData {
                challenge_participants: participants
                    .iter()
                    .zip(&evaluation.scores)
                    .map(|(participant, score)| PlotPoint {
                        metric_x: score.precision,
                        metric_y: score.recall,
                        participant_id: participant.clone(),
                    })
                    .collect(),
                visualization: Visualization {
                    kind: "2D-plot",
                    x_axis: AGGREGATION_X,
                    y_axis: AGGREGATION_Y,
                },
            },
        },
        kind: "aggregation",
    }));

    records.push(EventRecord::Challenge(Challenge {
        id: challenge.clone(),
        benchmarking_event_id: config.event_id.clone(),
        participants,
    }));
    records
}

pub fn tool_descriptor(predictor: &str, config: &ExportConfig) -> ToolDescriptor {
    let id = tool_id(predictor);
    ToolDescriptor {
        description: format!("Tool {id} from DbNSFP"),
        name: id.clone(),
        id,
        schema: TOOL_SCHEMA,
        community_ids: vec![config.community_id.clone()],
        is_automated: false,
        tool_contact_ids: config.contacts.clone(),
        status: "online",
        references: Vec::new(),
        tool_access: vec![ToolAccess {
            tool_access_type: "command-line",
            link: config.tool_link.clone(),
        }],
    }
}

pub fn metric_descriptor(metric: &str, config: &ExportConfig) -> MetricDescriptor {
    MetricDescriptor {
        id: metric.to_string(),
        schema: METRIC_SCHEMA,
        title: metric.to_string(),
        metrics_contact_ids: config.contacts.clone(),
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), ExportError> {
    let io = |source| ExportError::Io {
        path: path.to_path_buf(),
        source,
    };
    let file = File::create(path).map_err(io)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, value)?;
    writer.flush().map_err(io)?;
    Ok(())
}

/// Writes the event document and every descriptor under `out_dir`; returns the files written.
pub fn write_all(
    evaluation: &Evaluation,
    config: &ExportConfig,
    out_dir: &Path,
    validation_date: DateTime<Utc>,
) -> Result<Vec<PathBuf>, ExportError> {
    fs::create_dir_all(out_dir).map_err(|source| ExportError::Io {
        path: out_dir.to_path_buf(),
        source,
    })?;

    let mut written = Vec::new();
    let event = out_dir.join(EVENT_FILE);
    write_json(&event, &benchmarking_event(evaluation, config, validation_date))?;
    written.push(event);

    for score in &evaluation.scores {
        let descriptor = tool_descriptor(&score.predictor, config);
        let path = out_dir.join(format!("Tool.{}.json", descriptor.id));
        write_json(&path, &descriptor)?;
        written.push(path);
    }
    for metric in METRIC_FIELDS {
        let path = out_dir.join(format!("Metric.{metric}.json"));
        write_json(&path, &metric_descriptor(metric, config))?;
        written.push(path);
    }

    info!(
        "Exported {} predictors to {} JSON files in '{}'",
        evaluation.scores.len(),
        written.len(),
        out_dir.display()
    );
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{ConfusionMatrix, PredictorScore};
    use chrono::TimeZone;
    use serde_json::Value;
    use tempfile::tempdir;

    fn evaluation() -> Evaluation {
        Evaluation {
            scores: vec![
                PredictorScore::from_matrix(
                    "SIFT_pred",
                    ConfusionMatrix { tp: 3, tn: 2, fp: 1, fn_: 1 },
                ),
                PredictorScore::from_matrix(
                    "REVEL",
                    ConfusionMatrix { tp: 0, tn: 4, fp: 0, fn_: 2 },
                ),
            ],
        }
    }

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn ids_are_shortened() {
        assert_eq!(participant_id("SIFT_pred"), "SIFT_P");
        assert_eq!(participant_id("REVEL"), "REVEL");
        assert_eq!(tool_id("MutationTaster_pred"), "MutationTaster");
    }

    #[test]
    fn event_has_participants_assessments_aggregation_and_challenge() {
        let records = benchmarking_event(&evaluation(), &ExportConfig::default(), date());
        assert_eq!(records.len(), 2 + 2 * METRIC_FIELDS.len() + 2);

        let json = serde_json::to_value(&records).unwrap();
        assert_eq!(json[0]["_id"], "AMetaPred:SIFT_P");
        assert_eq!(json[0]["type"], "participant");
        assert_eq!(json[0]["datalink"]["validation_date"], "2024-03-01T12:00:00Z");

        let sift_tp = &json[2];
        assert_eq!(sift_tp["_id"], "AMetaPred:RD_SIFT_P_TP_A");
        assert_eq!(sift_tp["metrics"]["value"], 3.0);

        let challenge = &json[records.len() - 1];
        assert_eq!(challenge["id"], "RD");
        assert_eq!(challenge["benchmarking_event_id"], "AMetaPred-DDD");
        assert_eq!(challenge["participants"], serde_json::json!(["SIFT_P", "REVEL"]));
    }

    #[test]
    fn undefined_metrics_are_null() {
        let json = serde_json::to_value(benchmarking_event(
            &evaluation(),
            &ExportConfig::default(),
            date(),
        ))
        .unwrap();
        let precision_revel = json
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["_id"] == "AMetaPred:RD_REVEL_Precision_A")
            .unwrap();
        assert_eq!(precision_revel["metrics"]["value"], Value::Null);

        let aggregation = json
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["type"] == "aggregation")
            .unwrap();
        let points = &aggregation["datalink"]["inline_data"]["challenge_participants"];
        assert_eq!(points[1]["metric_x"], Value::Null);
        assert_eq!(points[0]["metric_x"], 0.75);
    }

    #[test]
    fn write_all_emits_one_file_per_tool_and_metric() {
        let dir = tempdir().unwrap();
        let config = ExportConfig {
            contacts: vec!["Jane.Doe".to_string()],
            ..ExportConfig::default()
        };
        let written = write_all(&evaluation(), &config, dir.path(), date()).unwrap();
        assert_eq!(written.len(), 1 + 2 + METRIC_FIELDS.len());

        let tool: Value =
            serde_json::from_slice(&fs::read(dir.path().join("Tool.SIFT.json")).unwrap()).unwrap();
        assert_eq!(tool["name"], "SIFT");
        assert_eq!(tool["tool_contact_ids"], serde_json::json!(["Jane.Doe"]));
        assert!(dir.path().join("Metric.MCC.json").exists());
        assert!(dir.path().join(EVENT_FILE).exists());
    }
}
