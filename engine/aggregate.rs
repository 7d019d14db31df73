// ========================================================================================
//
//                     REMOTE PER-MUTATION PREDICTOR AGGREGATION
//
// ========================================================================================
//
// The remote predictor answers one (accession, position, change) triple per request.
// Requests are independent, so they run on a bounded rayon pool; the accumulation into a
// single table happens afterwards on the calling thread, one merge per answer, in input
// order. A failed request only loses its own mutation.

use crate::bridge::IdentifierBridge;
use crate::table::{CollisionPolicy, KeyedTable, TableError};
use crate::types::{AminoAcidChange, IsoformMutation, ParseError};
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use itertools::Itertools;
use log::{debug, info, warn};
use rayon::prelude::*;
use std::io::IsTerminal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Field that carries the caller's mutation id on every fetched row.
pub const MUTATION_FIELD: &str = "Mutation";

const HTTP_USER_AGENT: &str = "ametapred-http-client/0.1";

/// Why a single remote request produced no rows. Never escapes the batch.
#[derive(Error, Debug)]
pub enum FetchFailure {
    #[error("Request to '{url}' timed out.")]
    Timeout { url: String },
    #[error("Request to '{url}' failed: {reason}")]
    Transport { url: String, reason: String },
    #[error("'{url}' answered with HTTP status {status}.")]
    Status { url: String, status: u16 },
    #[error("Payload for '{query}' is malformed: {reason}")]
    Payload { query: String, reason: String },
}

#[derive(Error, Debug)]
pub enum AggregateError {
    #[error("Failed to build the fetch worker pool: {0}")]
    WorkerPool(#[from] rayon::ThreadPoolBuildError),
    #[error("Failed to accumulate predictor rows: {0}")]
    Table(#[from] TableError),
}

/// One request to the remote predictor.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteQuery {
    pub accession: String,
    pub change: AminoAcidChange,
}

impl std::fmt::Display for RemoteQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.accession, self.change)
    }
}

/// The remote per-mutation predictor. Implementations must bound the time a call may take.
pub trait RemotePredictor: Send + Sync {
    fn fetch(&self, query: &RemoteQuery) -> Result<KeyedTable, FetchFailure>;
}

/// Blocking HTTP client for a predictor that serves comma-separated feature tables.
///
/// The URL template may use `{accession}`, `{reference}`, `{position}` and `{alternate}`.
pub struct HttpRemotePredictor {
    client: reqwest::blocking::Client,
    url_template: String,
}

impl HttpRemotePredictor {
    pub fn new(url_template: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::blocking::Client::builder()
            .user_agent(HTTP_USER_AGENT)
            .timeout(timeout)
            .build()?;
        Ok(Self::with_client(client, url_template))
    }

    /// Uses a preconfigured client; the caller owns its timeout and proxy settings.
    pub fn with_client(client: reqwest::blocking::Client, url_template: &str) -> Self {
        Self {
            client,
            url_template: url_template.to_string(),
        }
    }

    pub fn url_for(&self, query: &RemoteQuery) -> String {
        self.url_template
            .replace("{accession}", &query.accession)
            .replace("{reference}", &query.change.reference)
            .replace("{position}", &query.change.position.to_string())
            .replace("{alternate}", &query.change.alternate)
    }
}

impl RemotePredictor for HttpRemotePredictor {
    fn fetch(&self, query: &RemoteQuery) -> Result<KeyedTable, FetchFailure> {
        let url = self.url_for(query);
        let transport = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchFailure::Timeout { url: url.clone() }
            } else {
                FetchFailure::Transport {
                    url: url.clone(),
                    reason: e.to_string(),
                }
            }
        };
        let response = self.client.get(&url).send().map_err(transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchFailure::Status {
                url: url.clone(),
                status: status.as_u16(),
            });
        }

        let body = response.text().map_err(transport)?;
        KeyedTable::read_delimited(body.as_bytes(), b',', None).map_err(|e| {
            FetchFailure::Payload {
                query: query.to_string(),
                reason: e.to_string(),
            }
        })
    }
}

/// What one `fetch_all` call left out, and why.
#[derive(Debug, Default)]
pub struct FetchReport {
    pub requested: usize,
    pub fetched: usize,
    pub unresolved: Vec<String>,
    pub malformed: Vec<ParseError>,
    pub failed: Vec<(String, FetchFailure)>,
}

/// Accumulates remote predictor rows keyed by the caller's own mutation ids.
pub struct PredictorAggregator {
    bridge: IdentifierBridge,
    predictor: Arc<dyn RemotePredictor>,
    workers: usize,
    accumulated: KeyedTable,
    last_report: FetchReport,
}

impl PredictorAggregator {
    pub fn new(bridge: IdentifierBridge, predictor: Arc<dyn RemotePredictor>, workers: usize) -> Self {
        Self {
            bridge,
            predictor,
            workers: workers.max(1),
            accumulated: KeyedTable::empty(MUTATION_FIELD),
            last_report: FetchReport::default(),
        }
    }

    /// Fetches every `<isoform>:<change>` id and returns the union of all rows fetched so
    /// far, keyed by the original ids. Unmappable ids, malformed changes and failed requests
    /// are skipped and listed in `last_report`.
    pub fn fetch_all<S: AsRef<str>>(
        &mut self,
        mutation_ids: &[S],
    ) -> Result<KeyedTable, AggregateError> {
        let mut report = FetchReport {
            requested: mutation_ids.len(),
            ..FetchReport::default()
        };

        let mut pending = Vec::with_capacity(mutation_ids.len());
        for id in mutation_ids {
            let id = id.as_ref();
            let mutation = match IsoformMutation::parse(id) {
                Ok(mutation) => mutation,
                Err(e) => {
                    warn!("Skipping '{id}': {e}");
                    report.malformed.push(e);
                    continue;
                }
            };
            let Some(accession) = self.bridge.resolve(&mutation.isoform) else {
                debug!("No accession for isoform '{}', skipping '{id}'", mutation.isoform);
                report.unresolved.push(id.to_string());
                continue;
            };
            let query = RemoteQuery {
                accession,
                change: mutation.change,
            };
            pending.push((query, id.to_string()));
        }
        let pending: Vec<(RemoteQuery, String)> = pending.into_iter().unique().collect();

        let pb = create_progress_bar(pending.len() as u64, "remote predictor queries");
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.workers)
            .build()?;
        let predictor = &self.predictor;
        let answers: Vec<(String, Result<KeyedTable, FetchFailure>)> = pool.install(|| {
            pending
                .par_iter()
                .map(|(query, id)| {
                    let answer = predictor.fetch(query).and_then(|rows| tag_rows(rows, id));
                    pb.inc(1);
                    (id.clone(), answer)
                })
                .collect()
        });
        pb.finish_and_clear();

        for (id, answer) in answers {
            match answer {
                Ok(rows) => {
                    self.accumulated.merge(&rows);
                    report.fetched += 1;
                }
                Err(failure) => {
                    warn!("No remote prediction for '{id}': {failure}");
                    report.failed.push((id, failure));
                }
            }
        }

        info!(
            "Remote predictor: {} requested, {} fetched, {} unresolved, {} malformed, {} failed",
            report.requested,
            report.fetched,
            report.unresolved.len(),
            report.malformed.len(),
            report.failed.len()
        );
        self.last_report = report;
        Ok(self.accumulated.clone())
    }

    pub fn last_report(&self) -> &FetchReport {
        &self.last_report
    }

    pub fn table(&self) -> &KeyedTable {
        &self.accumulated
    }

    pub fn into_table(self) -> KeyedTable {
        self.accumulated
    }
}

/// Column the payload's own key moves to when the payload is keyed on `MUTATION_FIELD`.
const REPLACED_KEY_FIELD: &str = "Mutation.payload";

/// Stamps the originating mutation id on every row and re-keys on it. A `Mutation`
/// column already in the payload is replaced by the stamped id.
fn tag_rows(rows: KeyedTable, mutation_id: &str) -> Result<KeyedTable, FetchFailure> {
    let payload = |e: TableError| FetchFailure::Payload {
        query: mutation_id.to_string(),
        reason: e.to_string(),
    };
    let mut rows = rows;
    if rows.has_field(MUTATION_FIELD) {
        debug!("Payload for '{mutation_id}' has its own {MUTATION_FIELD} column; replacing it");
        rows = drop_field(&rows, MUTATION_FIELD).map_err(payload)?;
    }
    let keyed_on_mutation = rows.key_field() == MUTATION_FIELD;
    if keyed_on_mutation {
        debug!("Payload for '{mutation_id}' is keyed on {MUTATION_FIELD}; replacing it");
        rows.set_key_field(REPLACED_KEY_FIELD).map_err(payload)?;
    }
    rows.add_field(MUTATION_FIELD, |_, _| mutation_id.to_string())
        .map_err(payload)?;
    let tagged = rows
        .reorder(MUTATION_FIELD, CollisionPolicy::LastWriteWins)
        .map_err(payload)?;
    if keyed_on_mutation {
        return drop_field(&tagged, REPLACED_KEY_FIELD).map_err(payload);
    }
    Ok(tagged)
}

fn drop_field(table: &KeyedTable, field: &str) -> Result<KeyedTable, TableError> {
    let kept: Vec<&str> = table
        .fields()
        .iter()
        .map(String::as_str)
        .filter(|f| *f != field)
        .collect();
    table.slice(&kept)
}

fn create_progress_bar(len: u64, message: &str) -> ProgressBar {
    let draw_target = if std::io::stderr().is_terminal() {
        ProgressDrawTarget::stderr_with_hz(20)
    } else {
        ProgressDrawTarget::hidden()
    };

    let pb = ProgressBar::with_draw_target(Some(len), draw_target);
    if let Ok(style) = ProgressStyle::with_template(
        "> [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
    ) {
        pb.set_style(style.progress_chars("█▉▊▋▌▍▎▏  "));
    }
    pb.set_message(message.to_string());
    pb
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    struct FakePredictor {
        calls: AtomicUsize,
    }

    impl RemotePredictor for FakePredictor {
        fn fetch(&self, query: &RemoteQuery) -> Result<KeyedTable, FetchFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if query.accession == "DOWN" {
                return Err(FetchFailure::Status {
                    url: format!("http://predictor/{query}"),
                    status: 503,
                });
            }
            let payload = format!(
                "id,pred_disease,score\n{},{},0.{}\n",
                query.accession,
                query.change.alternate == "G",
                query.change.position
            );
            KeyedTable::read_delimited(payload.as_bytes(), b',', None).map_err(|e| {
                FetchFailure::Payload {
                    query: query.to_string(),
                    reason: e.to_string(),
                }
            })
        }
    }

    fn aggregator(calls: &Arc<FakePredictor>) -> PredictorAggregator {
        let mut accessions = HashMap::new();
        accessions.insert("P1".to_string(), "Q0001".to_string());
        accessions.insert("P3".to_string(), "DOWN".to_string());
        let bridge = IdentifierBridge::new(Arc::new(accessions));
        PredictorAggregator::new(bridge, calls.clone(), 2)
    }

    fn predictor() -> Arc<FakePredictor> {
        Arc::new(FakePredictor {
            calls: AtomicUsize::new(0),
        })
    }

    #[test]
    fn rows_are_keyed_by_original_ids_and_unresolved_are_dropped() {
        let fake = predictor();
        let mut agg = aggregator(&fake);
        let table = agg.fetch_all(&["P1:A10G", "P2:X3Z"]).unwrap();

        assert_eq!(table.len(), 1);
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["P1:A10G"]);
        assert_eq!(table.get("P1:A10G", "pred_disease"), Some("true"));
        assert_eq!(table.get("P1:A10G", "id"), Some("Q0001"));
        assert_eq!(agg.last_report().unresolved, vec!["P2:X3Z".to_string()]);
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_requests_are_skipped_without_aborting() {
        let fake = predictor();
        let mut agg = aggregator(&fake);
        let table = agg.fetch_all(&["P3:A1C", "P1:A10G", "P1:R5W"]).unwrap();

        assert_eq!(table.len(), 2);
        assert!(table.contains_key("P1:R5W"));
        assert_eq!(table.get("P1:R5W", "pred_disease"), Some("false"));
        let report = agg.last_report();
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, "P3:A1C");
        assert!(matches!(report.failed[0].1, FetchFailure::Status { status: 503, .. }));
    }

    #[test]
    fn malformed_changes_are_reported_not_fetched() {
        let fake = predictor();
        let mut agg = aggregator(&fake);
        let table = agg.fetch_all(&["P1:10G", "P1", "P1:A10G"]).unwrap();

        assert_eq!(table.len(), 1);
        let report = agg.last_report();
        assert_eq!(
            report.malformed,
            vec![
                ParseError::InvalidChange("10G".to_string()),
                ParseError::MissingSeparator("P1".to_string()),
            ]
        );
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_ids_are_fetched_once() {
        let fake = predictor();
        let mut agg = aggregator(&fake);
        agg.fetch_all(&["P1:A10G", "P1:A10G"]).unwrap();
        assert_eq!(fake.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn successive_calls_accumulate_the_union() {
        let fake = predictor();
        let mut agg = aggregator(&fake);
        agg.fetch_all(&["P1:A10G"]).unwrap();
        let table = agg.fetch_all(&["P1:R5W"]).unwrap();
        assert_eq!(table.keys().collect::<Vec<_>>(), vec!["P1:A10G", "P1:R5W"]);
        assert_eq!(agg.into_table().len(), 2);
    }

    #[test]
    fn payload_mutation_column_is_replaced_by_the_caller_id() {
        let rows = KeyedTable::read_delimited(
            "id,Mutation,pred_disease\nQ1,stale,true\n".as_bytes(),
            b',',
            None,
        )
        .unwrap();
        let tagged = tag_rows(rows, "P1:A10G").unwrap();
        assert_eq!(tagged.key_field(), MUTATION_FIELD);
        assert_eq!(tagged.fields(), &["id", "pred_disease"]);
        assert_eq!(tagged.get("P1:A10G", "pred_disease"), Some("true"));

        let keyed = KeyedTable::read_delimited(
            "Mutation,pred_disease\nstale,false\n".as_bytes(),
            b',',
            None,
        )
        .unwrap();
        let tagged = tag_rows(keyed, "P1:A10G").unwrap();
        assert_eq!(tagged.fields(), &["pred_disease"]);
        assert_eq!(tagged.get("P1:A10G", "pred_disease"), Some("false"));
    }

    /// Serves one connection on a local port: waits `delay`, then writes `response`.
    fn serve_once(response: &'static str, delay: Duration) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match stream.read(&mut buf) {
                    Ok(0) | Err(_) => return,
                    Ok(n) => request.extend_from_slice(&buf[..n]),
                }
            }
            thread::sleep(delay);
            let _ = stream.write_all(response.as_bytes());
        });
        format!("http://{addr}/{{accession}}/{{position}}/{{alternate}}")
    }

    fn local_predictor(url_template: &str, timeout: Duration) -> HttpRemotePredictor {
        let client = reqwest::blocking::Client::builder()
            .no_proxy()
            .timeout(timeout)
            .build()
            .unwrap();
        HttpRemotePredictor::with_client(client, url_template)
    }

    fn p53() -> RemoteQuery {
        RemoteQuery {
            accession: "P04637".to_string(),
            change: AminoAcidChange::parse("R175H").unwrap(),
        }
    }

    #[test]
    fn http_fetch_parses_a_csv_payload() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 28\r\nConnection: close\r\n\r\nid,pred_disease\nP04637,True\n",
            Duration::ZERO,
        );
        let rows = local_predictor(&url, Duration::from_secs(5)).fetch(&p53()).unwrap();
        assert_eq!(rows.get("P04637", "pred_disease"), Some("True"));
    }

    #[test]
    fn http_error_status_is_a_status_failure() {
        let url = serve_once(
            "HTTP/1.1 503 Service Unavailable\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Duration::ZERO,
        );
        let failure = local_predictor(&url, Duration::from_secs(5)).fetch(&p53()).unwrap_err();
        match failure {
            FetchFailure::Status { url, status } => {
                assert_eq!(status, 503);
                assert!(url.ends_with("/P04637/175/H"));
            }
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn http_body_without_header_is_a_payload_failure() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Duration::ZERO,
        );
        let failure = local_predictor(&url, Duration::from_secs(5)).fetch(&p53()).unwrap_err();
        assert!(matches!(failure, FetchFailure::Payload { .. }), "{failure}");
    }

    #[test]
    fn slow_http_answer_is_a_timeout() {
        let url = serve_once(
            "HTTP/1.1 200 OK\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            Duration::from_secs(3),
        );
        let failure = local_predictor(&url, Duration::from_millis(200))
            .fetch(&p53())
            .unwrap_err();
        assert!(matches!(failure, FetchFailure::Timeout { .. }), "{failure}");
    }

    #[test]
    fn url_template_fills_every_placeholder() {
        let http = HttpRemotePredictor::new(
            "https://predictor.example/{accession}/{position}/{alternate}/features.csv?ref={reference}",
            Duration::from_secs(1),
        )
        .unwrap();
        let query = RemoteQuery {
            accession: "P04637".to_string(),
            change: AminoAcidChange::parse("R175H").unwrap(),
        };
        assert_eq!(
            http.url_for(&query),
            "https://predictor.example/P04637/175/H/features.csv?ref=R"
        );
    }
}
