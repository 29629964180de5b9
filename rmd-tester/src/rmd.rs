// Copyright (c) Facebook, Inc. and its affiliates.
use chrono::prelude::*;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error as ThisError;

use super::Error;
use rmd_tester_intf::{PolicyType, RmdSettings, Settings};
use rmd_util::*;

const WORKLOADS: &str = "workloads";

#[derive(Debug, ThisError)]
pub enum RestError {
    #[error("{0}")]
    Transport(String),
    #[error("HTTP {code} {reason}: {body}")]
    Status {
        code: i32,
        reason: String,
        body: String,
    },
}

/// Minimal REST transport. Paths are relative to the endpoint's base URL and
/// successful responses are returned as parsed JSON, `Null` if empty.
pub trait RestClient {
    fn endpoint(&self) -> String;
    fn get(&self, path: &str) -> Result<Value, RestError>;
    fn post(&self, path: &str, body: &Value) -> Result<Value, RestError>;
    fn delete(&self, path: &str) -> Result<Value, RestError>;
}

pub struct HttpRestClient {
    base_url: String,
    timeout: u64,
}

impl HttpRestClient {
    pub fn new(rmd: &RmdSettings) -> Self {
        Self {
            base_url: rmd.base_url(),
            timeout: rmd.timeout,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", &self.base_url, path)
    }

    fn finish(resp: Result<minreq::Response, minreq::Error>) -> Result<Value, RestError> {
        let resp = resp.map_err(|e| RestError::Transport(e.to_string()))?;
        let body = resp
            .as_str()
            .map_err(|e| RestError::Transport(e.to_string()))?;

        if resp.status_code < 200 || resp.status_code >= 300 {
            return Err(RestError::Status {
                code: resp.status_code,
                reason: resp.reason_phrase.clone(),
                body: body.trim().to_string(),
            });
        }
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(body)
            .map_err(|e| RestError::Transport(format!("malformed response ({})", &e)))
    }
}

impl RestClient for HttpRestClient {
    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    fn get(&self, path: &str) -> Result<Value, RestError> {
        Self::finish(minreq::get(self.url(path)).with_timeout(self.timeout).send())
    }

    fn post(&self, path: &str, body: &Value) -> Result<Value, RestError> {
        Self::finish(
            minreq::post(self.url(path))
                .with_timeout(self.timeout)
                .with_json(body)
                .and_then(|req| req.send()),
        )
    }

    fn delete(&self, path: &str) -> Result<Value, RestError> {
        Self::finish(minreq::delete(self.url(path)).with_timeout(self.timeout).send())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AllocationPolicy {
    Cos { policy: String },
    MinMax { min_cache: u32, max_cache: u32 },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AllocationRequest {
    #[serde(skip)]
    pub cos: String,
    pub core_ids: Vec<String>,
    #[serde(flatten)]
    pub policy: AllocationPolicy,
}

const ALLOCATIONS_DOC: &str = "\
//
// rmd-tester allocation snapshot
//
// timestamp: When the snapshot was taken
// tracked: Allocation IDs created by rmd-tester and not released yet
// allocations: Listing returned by the RMD server
//
";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationsReport {
    pub timestamp: DateTime<Local>,
    pub tracked: Vec<String>,
    pub allocations: Value,
}

impl Default for AllocationsReport {
    fn default() -> Self {
        Self {
            timestamp: Local::now(),
            tracked: vec![],
            allocations: Value::Null,
        }
    }
}

impl JsonSave for AllocationsReport {
    fn preamble() -> Option<String> {
        Some(ALLOCATIONS_DOC.to_string())
    }
}

fn allocation_id(data: &Value) -> Option<String> {
    match data.get("id") {
        Some(Value::String(id)) => Some(id.clone()),
        Some(Value::Number(id)) => Some(id.to_string()),
        _ => None,
    }
}

/// Pretty-prints with four space indentation. serde_json objects are sorted
/// by key so the output is stable.
fn format_snapshot(data: &Value) -> String {
    let mut buf = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut buf, fmt);
    match data.serialize(&mut ser) {
        Ok(()) => String::from_utf8_lossy(&buf).into_owned(),
        Err(_) => data.to_string(),
    }
}

/// Creates, tracks and releases LLC allocations on an RMD server. Only
/// allocations created through this controller are tracked and released.
pub struct CacheAllocationController<C: RestClient> {
    rest: C,
    policy_type: PolicyType,
    cos_policies: BTreeMap<String, String>,
    cache_amounts: BTreeMap<String, Vec<u32>>,
    workload_ids: Vec<String>,
    report: JsonReportFile<AllocationsReport>,
}

impl CacheAllocationController<HttpRestClient> {
    pub fn connect(settings: &Settings) -> Result<Self, Error> {
        Self::with_client(HttpRestClient::new(&settings.rmd), settings)
    }
}

impl<C: RestClient> CacheAllocationController<C> {
    pub fn with_client(rest: C, settings: &Settings) -> Result<Self, Error> {
        if let Err(e) = rest.get(WORKLOADS) {
            return Err(Error::Connection(format!(
                "cannot connect to RMD server {} ({})",
                rest.endpoint(),
                &e
            )));
        }
        info!("rmd: Connected to {}", rest.endpoint());

        Ok(Self {
            rest,
            policy_type: settings.policy_type,
            cos_policies: settings.cos_policies.clone(),
            cache_amounts: settings.cache_amounts.clone(),
            workload_ids: vec![],
            report: JsonReportFile::new(settings.allocations_report.as_ref()),
        })
    }

    /// IDs of the allocations created and not yet released, oldest first.
    pub fn allocations(&self) -> &[String] {
        &self.workload_ids
    }

    /// Returns None if MinMax amounts for `cos` are incomplete.
    fn build_request(&self, cos: &str, cores: &[String]) -> Result<Option<AllocationRequest>, Error> {
        let policy = match self.policy_type {
            PolicyType::Cos => match self.cos_policies.get(cos) {
                Some(policy) => AllocationPolicy::Cos {
                    policy: policy.clone(),
                },
                None => return Err(Error::Config(format!("no COS policy for {:?}", cos))),
            },
            PolicyType::MinMax => match self.cache_amounts.get(cos).map(|v| v.as_slice()) {
                Some([min, max, ..]) => AllocationPolicy::MinMax {
                    min_cache: *min,
                    max_cache: *max,
                },
                _ => return Ok(None),
            },
        };
        Ok(Some(AllocationRequest {
            cos: cos.to_string(),
            core_ids: cores.to_vec(),
            policy,
        }))
    }

    /// Requests an allocation for each class of service in `affinity_map`,
    /// in order.
    ///
    /// In MinMax mode, the first class without both cache amounts ends the
    /// setup; the following classes are left without allocations.
    pub fn setup_allocations(&mut self, affinity_map: &[(String, Vec<String>)]) -> Result<(), Error> {
        for (cos, cores) in affinity_map.iter() {
            let req = match self.build_request(cos, cores)? {
                Some(v) => v,
                None => {
                    warn!(
                        "rmd: Incomplete cache amounts for {:?}, not setting up {:?} and after",
                        cos, cos
                    );
                    return Ok(());
                }
            };
            let body = serde_json::to_value(&req).map_err(|e| Error::Config(e.to_string()))?;
            debug!("rmd: POST {} {}", WORKLOADS, &body);

            match self.rest.post(WORKLOADS, &body) {
                Ok(data) => match allocation_id(&data) {
                    Some(id) => {
                        info!("rmd: Allocated {:?} for {} on cores {:?}", &id, cos, cores);
                        self.workload_ids.push(id);
                    }
                    None => warn!("rmd: No allocation id for {} in response {}", cos, &data),
                },
                Err(e) if e.to_string().contains("already exists") => {
                    return Err(Error::DuplicateAllocation(cos.clone()));
                }
                Err(e) => return Err(Error::Connection(format!("creating {:?} ({})", cos, &e))),
            }
        }
        Ok(())
    }

    pub fn setup_llc_allocation(&mut self, settings: &Settings) -> Result<(), Error> {
        self.setup_allocations(&settings.cos_affinity_map())
    }

    /// Deletes all tracked allocations in creation order. The ledger is
    /// cleared only if every deletion succeeds; on the first failure it is
    /// left untouched and the whole reset can be retried.
    pub fn reset_all_allocations(&mut self) -> Result<(), Error> {
        for id in self.workload_ids.iter() {
            if let Err(e) = self.rest.delete(&format!("{}/{}", WORKLOADS, id)) {
                return Err(Error::Connection(format!("deleting {:?} ({})", id, &e)));
            }
            info!("rmd: Released {:?}", id);
        }
        self.workload_ids.clear();
        Ok(())
    }

    pub fn log_allocations(&mut self) -> Result<Value, Error> {
        let data = self
            .rest
            .get(WORKLOADS)
            .map_err(|e| Error::Connection(format!("listing allocations ({})", &e)))?;
        info!("rmd: Current allocations: {}", format_snapshot(&data));

        if let Some(path) = self.report.path.clone() {
            self.report.data = AllocationsReport {
                timestamp: Local::now(),
                tracked: self.workload_ids.clone(),
                allocations: data.clone(),
            };
            if let Err(e) = self.report.commit() {
                warn!("rmd: Failed to update {:?} ({:#})", &path, &e);
            }
        }
        Ok(data)
    }
}

#[cfg(test)]
mod tests {
    use super::{AllocationsReport, CacheAllocationController, RestClient, RestError};
    use crate::Error;
    use rmd_tester_intf::{PolicyType, Settings};
    use serde_json::{json, Value};
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use std::rc::Rc;

    #[derive(Default)]
    struct MockState {
        requests: Vec<(String, String, Value)>,
        live: BTreeMap<String, String>,
        next_id: u32,
        unreachable: bool,
        omit_id: bool,
        fail_delete: Option<String>,
        fail_post: Option<RestError>,
        fail_get: bool,
    }

    #[derive(Clone, Default)]
    struct MockRmd(Rc<RefCell<MockState>>);

    impl MockRmd {
        fn requests(&self, method: &str) -> Vec<(String, Value)> {
            self.0
                .borrow()
                .requests
                .iter()
                .filter(|r| r.0 == method)
                .map(|r| (r.1.clone(), r.2.clone()))
                .collect()
        }
    }

    impl RestClient for MockRmd {
        fn endpoint(&self) -> String {
            "mock://rmd/v1/".into()
        }

        fn get(&self, path: &str) -> Result<Value, RestError> {
            let mut st = self.0.borrow_mut();
            if st.unreachable || st.fail_get {
                return Err(RestError::Transport("Connection refused".into()));
            }
            st.requests.push(("GET".into(), path.into(), Value::Null));
            let list: Vec<Value> = st
                .live
                .iter()
                .map(|(id, cores)| json!({ "id": id, "core_ids": cores }))
                .collect();
            Ok(Value::Array(list))
        }

        fn post(&self, path: &str, body: &Value) -> Result<Value, RestError> {
            let mut st = self.0.borrow_mut();
            st.requests.push(("POST".into(), path.into(), body.clone()));
            if let Some(e) = st.fail_post.take() {
                return Err(e);
            }
            let cores = body["core_ids"].to_string();
            if st.live.values().any(|c| c == &cores) {
                return Err(RestError::Status {
                    code: 400,
                    reason: "Bad Request".into(),
                    body: "workload already exists".into(),
                });
            }
            st.next_id += 1;
            let id = st.next_id;
            st.live.insert(id.to_string(), cores);
            if st.omit_id {
                return Ok(json!({ "status": "ok" }));
            }
            Ok(json!({ "id": id }))
        }

        fn delete(&self, path: &str) -> Result<Value, RestError> {
            let mut st = self.0.borrow_mut();
            st.requests.push(("DELETE".into(), path.into(), Value::Null));
            let id = path.trim_start_matches("workloads/").to_string();
            if st.fail_delete.as_ref() == Some(&id) {
                return Err(RestError::Status {
                    code: 500,
                    reason: "Internal Server Error".into(),
                    body: "busy".into(),
                });
            }
            st.live.remove(&id);
            Ok(Value::Null)
        }
    }

    fn affinity_map(nr: usize) -> Vec<(String, Vec<String>)> {
        (0..nr)
            .map(|i| (format!("WL{}", i), vec![format!("{}", 2 * i), format!("{}", 2 * i + 1)]))
            .collect()
    }

    fn controller(mock: &MockRmd, settings: &Settings) -> CacheAllocationController<MockRmd> {
        CacheAllocationController::with_client(mock.clone(), settings).unwrap()
    }

    #[test]
    fn test_connect_unreachable() {
        let mock = MockRmd::default();
        mock.0.borrow_mut().unreachable = true;
        match CacheAllocationController::with_client(mock, &Settings::default()) {
            Err(Error::Connection(msg)) => assert!(msg.contains("mock://rmd/v1/")),
            _ => panic!("connect should fail"),
        }
    }

    #[test]
    fn test_setup_cos() {
        let mock = MockRmd::default();
        let mut settings = Settings::default();
        settings.cos_policies.insert("WL2".into(), "bronze".into());
        let mut ctl = controller(&mock, &settings);

        ctl.setup_allocations(&affinity_map(3)).unwrap();

        let posts = mock.requests("POST");
        assert_eq!(posts.len(), 3);
        assert_eq!(posts[0].0, "workloads");
        assert_eq!(posts[0].1, json!({ "core_ids": ["0", "1"], "policy": "gold" }));
        assert_eq!(posts[2].1, json!({ "core_ids": ["4", "5"], "policy": "bronze" }));
        assert_eq!(ctl.allocations().len(), 3);
    }

    #[test]
    fn test_setup_cos_missing_policy() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        match ctl.setup_allocations(&affinity_map(3)) {
            Err(Error::Config(_)) => {}
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(mock.requests("POST").len(), 2);
        assert_eq!(ctl.allocations().len(), 2);
    }

    #[test]
    fn test_setup_minmax_short_circuit() {
        let mock = MockRmd::default();
        let mut settings = Settings::default();
        settings.policy_type = PolicyType::MinMax;
        settings.cache_amounts.insert("WL1".into(), vec![1]);
        settings.cache_amounts.insert("WL2".into(), vec![3, 6]);
        let mut ctl = controller(&mock, &settings);

        ctl.setup_allocations(&affinity_map(3)).unwrap();

        let posts = mock.requests("POST");
        assert_eq!(posts.len(), 1);
        assert_eq!(
            posts[0].1,
            json!({ "core_ids": ["0", "1"], "min_cache": 2, "max_cache": 4 })
        );
        assert_eq!(ctl.allocations().len(), 1);
    }

    #[test]
    fn test_setup_minmax_index_order() {
        let mock = MockRmd::default();
        let mut settings = Settings::default();
        settings.policy_type = PolicyType::MinMax;
        settings.vm_count = 0;
        settings.process_count = 12;
        settings.core_binding = (0..12).map(|i| vec![format!("{}", i)]).collect();
        settings.cache_amounts = (0..12)
            .filter(|i| *i != 2)
            .map(|i| (format!("WL{}", i), vec![1, 2]))
            .collect();
        let mut ctl = controller(&mock, &settings);

        ctl.setup_llc_allocation(&settings).unwrap();

        let cores: Vec<Value> = mock
            .requests("POST")
            .into_iter()
            .map(|r| r.1["core_ids"].clone())
            .collect();
        assert_eq!(cores, vec![json!(["0"]), json!(["1"])]);
        assert_eq!(ctl.allocations().len(), 2);
    }

    #[test]
    fn test_setup_service_error() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        ctl.setup_allocations(&affinity_map(1)).unwrap();
        mock.0.borrow_mut().fail_post = Some(RestError::Status {
            code: 500,
            reason: "Internal Server Error".into(),
            body: "no free cache ways".into(),
        });

        match ctl.setup_allocations(&affinity_map(2)[1..]) {
            Err(Error::Connection(msg)) => {
                assert!(msg.contains("WL1"));
                assert!(msg.contains("no free cache ways"));
            }
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(ctl.allocations(), &["1".to_string()]);

        mock.0.borrow_mut().fail_post =
            Some(RestError::Transport("Connection reset by peer".into()));
        match ctl.setup_allocations(&affinity_map(2)[1..]) {
            Err(Error::Connection(msg)) => assert!(msg.contains("Connection reset by peer")),
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(ctl.allocations().len(), 1);
    }

    #[test]
    fn test_log_allocations_unreachable() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        ctl.setup_allocations(&affinity_map(2)).unwrap();
        mock.0.borrow_mut().fail_get = true;

        match ctl.log_allocations() {
            Err(Error::Connection(msg)) => {
                assert!(msg.contains("listing allocations"));
                assert!(msg.contains("Connection refused"));
            }
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(ctl.allocations(), &["1".to_string(), "2".to_string()]);
    }

    #[test]
    fn test_setup_duplicate() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        let map = affinity_map(1);

        ctl.setup_allocations(&map).unwrap();
        assert_eq!(ctl.allocations().len(), 1);

        match ctl.setup_allocations(&map) {
            Err(Error::DuplicateAllocation(cos)) => assert_eq!(cos, "WL0"),
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(ctl.allocations().len(), 1);
    }

    #[test]
    fn test_setup_without_id() {
        let mock = MockRmd::default();
        mock.0.borrow_mut().omit_id = true;
        let mut ctl = controller(&mock, &Settings::default());

        ctl.setup_allocations(&affinity_map(2)).unwrap();
        assert_eq!(mock.requests("POST").len(), 2);
        assert!(ctl.allocations().is_empty());
    }

    #[test]
    fn test_reset_in_order() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        ctl.setup_llc_allocation(&Settings::default()).unwrap();
        let ids = ctl.allocations().to_vec();
        assert_eq!(ids.len(), 2);

        ctl.reset_all_allocations().unwrap();

        let deletes: Vec<String> = mock.requests("DELETE").into_iter().map(|r| r.0).collect();
        assert_eq!(
            deletes,
            ids.iter().map(|id| format!("workloads/{}", id)).collect::<Vec<_>>()
        );
        assert!(ctl.allocations().is_empty());
        assert!(mock.0.borrow().live.is_empty());

        // nothing left to delete
        ctl.reset_all_allocations().unwrap();
        assert_eq!(mock.requests("DELETE").len(), 2);
    }

    #[test]
    fn test_reset_failure_keeps_ledger() {
        let mock = MockRmd::default();
        let mut ctl = controller(&mock, &Settings::default());
        ctl.setup_allocations(&affinity_map(2)).unwrap();
        let ids = ctl.allocations().to_vec();
        mock.0.borrow_mut().fail_delete = Some(ids[1].clone());

        match ctl.reset_all_allocations() {
            Err(Error::Connection(msg)) => assert!(msg.contains("busy")),
            v => panic!("unexpected {:?}", v),
        }
        assert_eq!(ctl.allocations(), &ids[..]);
        assert_eq!(mock.requests("DELETE").len(), 2);

        // the retry deletes every id again, including the one already gone
        mock.0.borrow_mut().fail_delete = None;
        ctl.reset_all_allocations().unwrap();
        assert!(ctl.allocations().is_empty());
        let deletes: Vec<String> = mock.requests("DELETE").into_iter().map(|r| r.0).collect();
        assert_eq!(
            deletes,
            vec!["workloads/1", "workloads/2", "workloads/1", "workloads/2"]
        );
    }

    #[test]
    fn test_log_allocations() {
        let dir = tempfile::tempdir().unwrap();
        let report = dir.path().join("allocations.json");
        let mock = MockRmd::default();
        let mut settings = Settings::default();
        settings.allocations_report = Some(report.to_str().unwrap().into());
        let mut ctl = controller(&mock, &settings);
        ctl.setup_allocations(&affinity_map(2)).unwrap();

        let data = ctl.log_allocations().unwrap();
        assert_eq!(data.as_array().unwrap().len(), 2);
        assert_eq!(ctl.allocations(), &["1".to_string(), "2".to_string()]);

        let body = std::fs::read_to_string(&report).unwrap();
        assert!(body.starts_with("//"));
        let report: AllocationsReport = serde_json::from_str(
            &body
                .lines()
                .filter(|l| !l.starts_with("//"))
                .collect::<Vec<_>>()
                .join("\n"),
        )
        .unwrap();
        assert_eq!(report.tracked, ctl.allocations());
        assert_eq!(report.allocations, data);
    }

    #[test]
    fn test_format_snapshot_sorted() {
        let out = super::format_snapshot(&json!({ "b": 1, "a": { "d": 2, "c": 3 } }));
        assert_eq!(
            out,
            "{\n    \"a\": {\n        \"c\": 3,\n        \"d\": 2\n    },\n    \"b\": 1\n}"
        );
    }
}
