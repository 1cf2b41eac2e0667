mod fanout;
mod locations;
mod pagination;
mod postprocess;
pub mod result;
pub mod transport;

use crate::schema::{
    CallGraph, EndpointId, EndpointSpec, LocationScope, Tier, LOCATION_PLACEHOLDER,
    PROJECT_PLACEHOLDER,
};
use fanout::{plan_dependent, render_template};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

pub use locations::{LocationSet, RegionPartition};
pub use result::{
    CallError, CallResult, CollectionResult, InstanceResult, LocationResult, GLOBAL_LOCATION,
};
pub use transport::{ApiRequest, ApiTransport, FixtureTransport, HttpTransport, TransportError};

/// Credentials and identity of the account being scanned.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ScanTarget {
    pub project_id: String,
    #[serde(default)]
    pub organization_id: Option<String>,
    #[serde(default, skip_serializing)]
    pub access_token: Option<String>,
    /// The scan covers an organization rather than a single account.
    #[serde(default)]
    pub organization: bool,
}

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub pagination_disabled: bool,
    pub partition: RegionPartition,
    /// Simultaneous in-flight requests within a tier.
    pub max_in_flight: usize,
    pub max_pages: usize,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            pagination_disabled: false,
            partition: RegionPartition::Standard,
            max_in_flight: 20,
            max_pages: 500,
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CollectError {
    #[error("nothing to collect: no required endpoint is known to the call graph")]
    NothingToCollect,

    #[error("no primary endpoint returned data ({failed} of {attempted} locations failed)")]
    NoPrimaryData { attempted: usize, failed: usize },
}

/// Harvests the endpoints a scan needs, tier by tier.
pub struct Collector {
    graph: Arc<CallGraph>,
    transport: Arc<dyn ApiTransport>,
    options: CollectOptions,
}

/// One request instance: an endpoint bound to a location and, for dependent
/// endpoints, to one upstream resource.
struct Job {
    spec: Arc<EndpointSpec>,
    location: String,
    resource: Option<String>,
    vars: HashMap<String, String>,
}

enum Payload {
    Records(Vec<Value>),
    Partitioned(BTreeMap<String, Vec<Value>>),
}

struct JobOutcome {
    spec: Arc<EndpointSpec>,
    location: String,
    resource: Option<String>,
    payload: Payload,
    error: Option<CallError>,
}

impl Collector {
    pub fn new(graph: Arc<CallGraph>, transport: Arc<dyn ApiTransport>, options: CollectOptions) -> Self {
        Self {
            graph,
            transport,
            options,
        }
    }

    pub fn options(&self) -> &CollectOptions {
        &self.options
    }

    /// Collect `required` endpoints (plus their dependencies) for `target`.
    ///
    /// Tiers run strictly in order; a tier starts only after every request
    /// of the previous tier has settled. Individual request failures are
    /// recorded in the result, never propagated.
    pub async fn collect(
        &self,
        target: &ScanTarget,
        required: &[EndpointId],
    ) -> Result<CollectionResult, CollectError> {
        let closure = self.graph.closure(required);
        for unknown in &closure.unknown {
            warn!(endpoint = %unknown, "required endpoint is not in the call graph; ignoring");
        }
        if closure.endpoints.is_empty() {
            return Err(CollectError::NothingToCollect);
        }

        let selected: Vec<Arc<EndpointSpec>> = closure
            .endpoints
            .iter()
            .filter_map(|id| self.graph.get(id).cloned())
            .collect();

        let gate = Arc::new(Semaphore::new(self.options.max_in_flight.max(1)));
        let needs = |scope: LocationScope| selected.iter().any(|s| s.scope == scope);
        let locations = locations::resolve(
            self.transport.as_ref(),
            &gate,
            self.graph.locations(),
            target,
            &self.options,
            needs(LocationScope::Region),
            needs(LocationScope::Zone),
        )
        .await;

        let mut collection = CollectionResult::new();
        for tier in Tier::ALL {
            let specs: Vec<&Arc<EndpointSpec>> = selected.iter().filter(|s| s.tier == tier).collect();
            if specs.is_empty() {
                continue;
            }

            let mut jobs = Vec::new();
            for spec in &specs {
                if spec.is_dependent() {
                    jobs.extend(self.plan_dependent_jobs(spec, target, &mut collection));
                } else {
                    jobs.extend(self.plan_independent_jobs(spec, target, &locations, &mut collection));
                }
            }

            info!(tier = %tier, endpoints = specs.len(), requests = jobs.len(), "collecting tier");
            for outcome in self.run_jobs(jobs, &gate).await {
                merge(&mut collection, outcome);
            }

            if tier == Tier::Primary {
                check_primary(&collection, &specs)?;
            }
        }

        info!(
            services = collection.services().count(),
            records = collection.total_records(),
            "collection complete"
        );
        Ok(collection)
    }

    fn plan_independent_jobs(
        &self,
        spec: &Arc<EndpointSpec>,
        target: &ScanTarget,
        locations: &LocationSet,
        collection: &mut CollectionResult,
    ) -> Vec<Job> {
        collection.ensure_call(&spec.id);

        if spec.scope == LocationScope::Global {
            return vec![Job {
                spec: Arc::clone(spec),
                location: GLOBAL_LOCATION.to_string(),
                resource: None,
                vars: base_vars(target),
            }];
        }

        locations
            .for_scope(spec.scope)
            .iter()
            .map(|location| {
                let mut vars = base_vars(target);
                vars.insert(LOCATION_PLACEHOLDER.to_string(), location.clone());
                Job {
                    spec: Arc::clone(spec),
                    location: location.clone(),
                    resource: None,
                    vars,
                }
            })
            .collect()
    }

    fn plan_dependent_jobs(
        &self,
        spec: &Arc<EndpointSpec>,
        target: &ScanTarget,
        collection: &mut CollectionResult,
    ) -> Vec<Job> {
        let plan = plan_dependent(spec, collection);

        let call = collection.ensure_call(&spec.id);
        for (location, upstream_error) in &plan.upstream_locations {
            let has_instances = plan.bindings.iter().any(|b| &b.location == location);
            let entry = call.entry(location.clone()).or_default();
            if !has_instances {
                if let Some(upstream_error) = upstream_error {
                    entry.error = Some(CallError {
                        message: format!("upstream request failed: {}", upstream_error.message),
                        status: upstream_error.status,
                    });
                }
            }
        }

        let mut jobs = Vec::new();
        for binding in plan.bindings {
            match binding.values {
                Ok(values) => {
                    let mut vars = base_vars(target);
                    vars.extend(values);
                    if spec.scope != LocationScope::Global {
                        vars.insert(LOCATION_PLACEHOLDER.to_string(), binding.location.clone());
                    }
                    jobs.push(Job {
                        spec: Arc::clone(spec),
                        location: binding.location,
                        resource: Some(binding.resource),
                        vars,
                    });
                }
                Err(error) => {
                    debug!(endpoint = %spec.id, resource = %binding.resource, error = %error.message, "skipping unbindable instance");
                    call.entry(binding.location)
                        .or_default()
                        .push_instance(binding.resource, Vec::new(), Some(error));
                }
            }
        }
        jobs
    }

    async fn run_jobs(&self, jobs: Vec<Job>, gate: &Arc<Semaphore>) -> Vec<JobOutcome> {
        let mut set = JoinSet::new();
        for job in jobs {
            let transport = Arc::clone(&self.transport);
            let gate = Arc::clone(gate);
            let options = self.options.clone();
            set.spawn(async move { execute(job, transport.as_ref(), &gate, &options).await });
        }

        let mut outcomes = Vec::with_capacity(set.len());
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(join_error) => error!(%join_error, "collector task aborted"),
            }
        }
        outcomes
    }
}

fn base_vars(target: &ScanTarget) -> HashMap<String, String> {
    HashMap::from([(PROJECT_PLACEHOLDER.to_string(), target.project_id.clone())])
}

async fn execute(job: Job, transport: &dyn ApiTransport, gate: &Semaphore, options: &CollectOptions) -> JobOutcome {
    let Job {
        spec,
        location,
        resource,
        vars,
    } = job;

    let url = match render_template(&spec.url, &vars) {
        Ok(url) => url,
        Err(token) => {
            return JobOutcome {
                error: Some(CallError::new(format!("placeholder {{{token}}} is unbound"))),
                payload: Payload::Records(Vec::new()),
                spec,
                location,
                resource,
            };
        }
    };

    let request = ApiRequest {
        endpoint: spec.id.clone(),
        method: spec.method,
        url,
        query: Vec::new(),
    };
    let paging = if options.pagination_disabled {
        None
    } else {
        spec.paging.as_ref()
    };

    let run = pagination::fetch_pages(transport, gate, request, paging, options.max_pages, |page| {
        postprocess::page_len(&spec, page)
    })
    .await;

    let payload = if spec.aggregated {
        Payload::Partitioned(postprocess::partition_aggregated(&run.pages, options.partition))
    } else {
        Payload::Records(
            run.pages
                .iter()
                .flat_map(|page| postprocess::extract_records(page, spec.records_key.as_deref()))
                .collect(),
        )
    };

    JobOutcome {
        error: run.error.map(CallError::from),
        payload,
        spec,
        location,
        resource,
    }
}

fn merge(collection: &mut CollectionResult, outcome: JobOutcome) {
    let JobOutcome {
        spec,
        location,
        resource,
        payload,
        error,
    } = outcome;

    if let Some(error) = &error {
        warn!(endpoint = %spec.id, location = %location, resource = ?resource, error = %error.message, "request failed");
    }

    match (payload, resource) {
        (Payload::Partitioned(partitioned), _) => {
            let call = collection.ensure_call(&spec.id);
            for (location, records) in partitioned {
                call.entry(location).or_default().records.extend(records);
            }
            if error.is_some() {
                call.entry(location).or_default().error = error;
            }
        }
        (Payload::Records(records), Some(resource)) => {
            collection
                .ensure_call(&spec.id)
                .entry(location)
                .or_default()
                .push_instance(resource, records, error);
        }
        (Payload::Records(records), None) => {
            collection.insert(
                &spec.id,
                location,
                LocationResult {
                    records,
                    error,
                    instances: Vec::new(),
                },
            );
        }
    }
}

fn check_primary(collection: &CollectionResult, specs: &[&Arc<EndpointSpec>]) -> Result<(), CollectError> {
    if specs.iter().any(|spec| collection.has_data(&spec.id)) {
        return Ok(());
    }

    let (attempted, failed) = specs
        .iter()
        .filter_map(|spec| collection.call(&spec.id))
        .flat_map(|locations| locations.values())
        .fold((0, 0), |(attempted, failed), result| {
            (attempted + 1, failed + usize::from(result.error.is_some()))
        });
    Err(CollectError::NoPrimaryData { attempted, failed })
}
