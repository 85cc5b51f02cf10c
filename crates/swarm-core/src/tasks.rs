use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::config::{DeletePolicy, TaskConfig};
use crate::error::StateInconsistency;
use crate::executor::{Method, RequestSpec, CLIENT_API_ENDPOINT};
use crate::user::{random_rating, LeaderboardRow, VirtualUserState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskKind {
    CreateRow,
    ListRowsPaginated,
    GetRow,
    UpdateRow,
    DeleteRow,
    Stop,
}

impl TaskKind {
    pub const COUNT: usize = 6;
    pub const ALL: [TaskKind; Self::COUNT] = [
        TaskKind::CreateRow,
        TaskKind::ListRowsPaginated,
        TaskKind::GetRow,
        TaskKind::UpdateRow,
        TaskKind::DeleteRow,
        TaskKind::Stop,
    ];

    pub fn name(self) -> &'static str {
        match self {
            TaskKind::CreateRow => "create-row",
            TaskKind::ListRowsPaginated => "list-rows-paginated",
            TaskKind::GetRow => "get-row",
            TaskKind::UpdateRow => "update-row",
            TaskKind::DeleteRow => "delete-row",
            TaskKind::Stop => "stop",
        }
    }

    pub fn requires_known_resource(self) -> bool {
        matches!(
            self,
            TaskKind::ListRowsPaginated
                | TaskKind::GetRow
                | TaskKind::UpdateRow
                | TaskKind::DeleteRow
        )
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskDescriptor {
    pub kind: TaskKind,
    pub name: &'static str,
    pub weight: u32,
    pub requires_known_resource: bool,
}

impl TaskDescriptor {
    pub fn new(kind: TaskKind, weight: u32) -> Self {
        Self {
            kind,
            name: kind.name(),
            weight,
            requires_known_resource: kind.requires_known_resource(),
        }
    }

    pub fn is_eligible(&self, state: &VirtualUserState) -> bool {
        !self.requires_known_resource || state.has_known_ids()
    }
}

/// What a selected task asks the lifecycle to do.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskPlan {
    Request {
        request: RequestSpec,
        /// Known id to drop once the request comes back successful.
        forget_on_success: Option<u16>,
    },
    /// Nothing to do against the current state.
    Skip,
    Stop,
}

/// Weighted selection table over every task kind, shared read-only by all users.
///
/// Two distributions are precomputed: one over all tasks and one over the tasks
/// that stay eligible with an empty known set.
#[derive(Debug, Clone)]
pub struct TaskCatalog {
    descriptors: Vec<TaskDescriptor>,
    all: WeightedIndex<u32>,
    unconditional: WeightedIndex<u32>,
    unconditional_idx: Vec<usize>,
    page_offset: u32,
    page_limit: u32,
    delete_policy: DeletePolicy,
}

impl TaskCatalog {
    pub fn from_config(config: &TaskConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let weights = [
            config.create_row,
            config.list_rows_paginated,
            config.get_row,
            config.update_row,
            config.delete_row,
            config.stop,
        ];
        let descriptors = TaskKind::ALL
            .iter()
            .zip(weights)
            .map(|(kind, weight)| TaskDescriptor::new(*kind, weight))
            .collect();
        let mut catalog = Self::new(descriptors)?;
        catalog.page_offset = config.page_offset;
        catalog.page_limit = config.page_limit;
        catalog.delete_policy = config.delete_policy;
        Ok(catalog)
    }

    /// `descriptors` must hold exactly one entry per task kind, in `TaskKind::ALL` order.
    pub fn new(descriptors: Vec<TaskDescriptor>) -> anyhow::Result<Self> {
        let kinds: Vec<TaskKind> = descriptors.iter().map(|d| d.kind).collect();
        if kinds != TaskKind::ALL {
            anyhow::bail!("task catalog must list every task kind once, in order");
        }
        if let Some(d) = descriptors.iter().find(|d| d.weight == 0) {
            anyhow::bail!("task {} has zero weight", d.name);
        }
        let total: u64 = descriptors.iter().map(|d| u64::from(d.weight)).sum();
        if total > u64::from(u32::MAX) {
            anyhow::bail!("task weights sum to {total}, above the limit of {}", u32::MAX);
        }

        let all = WeightedIndex::new(descriptors.iter().map(|d| d.weight))?;
        let unconditional_idx: Vec<usize> = descriptors
            .iter()
            .enumerate()
            .filter(|(_, d)| !d.requires_known_resource)
            .map(|(idx, _)| idx)
            .collect();
        let unconditional =
            WeightedIndex::new(unconditional_idx.iter().map(|&idx| descriptors[idx].weight))?;

        let defaults = TaskConfig::default();
        Ok(Self {
            descriptors,
            all,
            unconditional,
            unconditional_idx,
            page_offset: defaults.page_offset,
            page_limit: defaults.page_limit,
            delete_policy: defaults.delete_policy,
        })
    }

    pub fn descriptors(&self) -> &[TaskDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, kind: TaskKind) -> &TaskDescriptor {
        &self.descriptors[kind.index()]
    }

    pub fn delete_policy(&self) -> DeletePolicy {
        self.delete_policy
    }

    pub fn with_delete_policy(mut self, policy: DeletePolicy) -> Self {
        self.delete_policy = policy;
        self
    }

    /// Weighted-random choice among the tasks eligible for `state`.
    pub fn select<R: Rng + ?Sized>(&self, state: &VirtualUserState, rng: &mut R) -> TaskKind {
        let idx = if state.has_known_ids() {
            self.all.sample(rng)
        } else {
            self.unconditional_idx[self.unconditional.sample(rng)]
        };
        debug_assert!(self.descriptors[idx].is_eligible(state));
        self.descriptors[idx].kind
    }

    /// Applies the task's effect on `state` and builds its request.
    pub fn plan<R: Rng + ?Sized>(
        &self,
        kind: TaskKind,
        state: &mut VirtualUserState,
        rng: &mut R,
    ) -> Result<TaskPlan, StateInconsistency> {
        let headers = state.headers();
        let client_id = state.client_id().to_string();

        let plan = match kind {
            TaskKind::CreateRow => {
                let row = LeaderboardRow::random(&client_id, rng);
                state.remember(row.leaderboard_id);
                request(
                    Method::Post,
                    CLIENT_API_ENDPOINT.to_string(),
                    CLIENT_API_ENDPOINT,
                    headers,
                    Some(&row),
                )
            }
            TaskKind::ListRowsPaginated => match state.random_known_id(rng) {
                Some(id) => request(
                    Method::Get,
                    format!(
                        "{CLIENT_API_ENDPOINT}/{id}?offset={}&limit={}",
                        self.page_offset, self.page_limit
                    ),
                    "/api/Client/{leaderboard_id}?offset={offset}&limit={limit}",
                    headers,
                    None,
                ),
                None => TaskPlan::Skip,
            },
            TaskKind::GetRow => match state.random_known_id(rng) {
                Some(id) => request(
                    Method::Get,
                    format!("{CLIENT_API_ENDPOINT}/{client_id}/{id}"),
                    "/api/Client/{client_id}/{leaderboard_id}",
                    headers,
                    None,
                ),
                None => TaskPlan::Skip,
            },
            TaskKind::UpdateRow => match state.random_known_id(rng) {
                Some(id) => {
                    let row = LeaderboardRow {
                        client_id: client_id.clone(),
                        rating: random_rating(rng),
                        leaderboard_id: id,
                    };
                    request(
                        Method::Put,
                        CLIENT_API_ENDPOINT.to_string(),
                        CLIENT_API_ENDPOINT,
                        headers,
                        Some(&row),
                    )
                }
                None => TaskPlan::Skip,
            },
            TaskKind::DeleteRow => match state.random_known_id(rng) {
                Some(id) => {
                    let forget_on_success = match self.delete_policy {
                        DeletePolicy::Optimistic => {
                            state.forget(id)?;
                            None
                        }
                        DeletePolicy::OnSuccess => Some(id),
                    };
                    let request = RequestSpec {
                        method: Method::Delete,
                        path: format!("{CLIENT_API_ENDPOINT}/{client_id}/{id}"),
                        name: "/api/Client/{client_id}/{leaderboard_id}".to_string(),
                        headers,
                        body: None,
                    };
                    TaskPlan::Request {
                        request,
                        forget_on_success,
                    }
                }
                None => TaskPlan::Skip,
            },
            TaskKind::Stop => TaskPlan::Stop,
        };
        Ok(plan)
    }
}

fn request(
    method: Method,
    path: String,
    name: &str,
    headers: Vec<(String, String)>,
    row: Option<&LeaderboardRow>,
) -> TaskPlan {
    TaskPlan::Request {
        request: RequestSpec {
            method,
            path,
            name: name.to_string(),
            headers,
            body: row.map(|r| json!(r)),
        },
        forget_on_success: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::user::LEADERBOARD_ID_RANGE;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn setup() -> (TaskCatalog, VirtualUserState, StdRng) {
        let mut rng = StdRng::seed_from_u64(2024);
        let state = VirtualUserState::new(&mut rng);
        (TaskCatalog::from_config(&TaskConfig::default()).unwrap(), state, rng)
    }

    fn frequencies(
        catalog: &TaskCatalog,
        state: &VirtualUserState,
        rng: &mut StdRng,
        draws: u32,
    ) -> [u32; TaskKind::COUNT] {
        let mut counts = [0u32; TaskKind::COUNT];
        for _ in 0..draws {
            counts[catalog.select(state, rng).index()] += 1;
        }
        counts
    }

    #[test]
    fn test_selection_frequency_tracks_weights() {
        let (catalog, mut state, mut rng) = setup();
        state.remember(1);

        let draws = 150_000;
        let counts = frequencies(&catalog, &state, &mut rng, draws);
        let total_weight: u32 = catalog.descriptors().iter().map(|d| d.weight).sum();

        for d in catalog.descriptors() {
            let expected = d.weight as f64 / total_weight as f64;
            let observed = counts[d.kind.index()] as f64 / draws as f64;
            assert!(
                (observed - expected).abs() < 0.01,
                "{}: expected {expected:.3}, observed {observed:.3}",
                d.name
            );
        }
    }

    #[test]
    fn test_equal_weights_have_no_ordering_bias() {
        let descriptors = TaskKind::ALL
            .iter()
            .map(|kind| TaskDescriptor::new(*kind, 5))
            .collect();
        let catalog = TaskCatalog::new(descriptors).unwrap();
        let mut rng = StdRng::seed_from_u64(3);
        let mut state = VirtualUserState::new(&mut rng);
        state.remember(9);

        let counts = frequencies(&catalog, &state, &mut rng, 60_000);
        for count in counts {
            assert!((9_400..=10_600).contains(&count), "counts: {counts:?}");
        }
    }

    #[test]
    fn test_empty_known_set_restricts_selection() {
        let (catalog, state, mut rng) = setup();
        let counts = frequencies(&catalog, &state, &mut rng, 50_000);

        for kind in TaskKind::ALL {
            if kind.requires_known_resource() {
                assert_eq!(counts[kind.index()], 0, "{kind} selected with no known ids");
            }
        }
        // create-row 4 vs stop 1 among the eligible pair
        let create = counts[TaskKind::CreateRow.index()] as f64 / 50_000.0;
        assert!((create - 0.8).abs() < 0.01, "create share {create:.3}");
    }

    #[test]
    fn test_create_row_remembers_id() {
        let (catalog, mut state, mut rng) = setup();
        for _ in 0..500 {
            let plan = catalog
                .plan(TaskKind::CreateRow, &mut state, &mut rng)
                .unwrap();
            let TaskPlan::Request { request, .. } = plan else {
                panic!("create-row must issue a request");
            };
            assert_eq!(request.method, Method::Post);
            let body = request.body.unwrap();
            let id = body["LeaderboardId"].as_u64().unwrap() as u16;
            assert!(LEADERBOARD_ID_RANGE.contains(&id));
            assert!(state.contains(id));
        }
        // 500 draws over 251 ids must collide; the set stays duplicate-free.
        assert!(state.known_ids().len() <= 251);
    }

    #[test]
    fn test_delete_row_optimistic_removal() {
        let (catalog, mut state, mut rng) = setup();
        state.remember(42);

        let plan = catalog
            .plan(TaskKind::DeleteRow, &mut state, &mut rng)
            .unwrap();
        let TaskPlan::Request {
            request,
            forget_on_success,
        } = plan
        else {
            panic!("delete-row must issue a request");
        };
        assert_eq!(request.method, Method::Delete);
        assert_eq!(
            request.path,
            format!("/api/Client/{}/42", state.client_id())
        );
        assert_eq!(forget_on_success, None);
        assert!(!state.contains(42));
    }

    #[test]
    fn test_delete_row_on_success_defers_removal() {
        let (catalog, mut state, mut rng) = setup();
        let catalog = catalog.with_delete_policy(DeletePolicy::OnSuccess);
        state.remember(42);

        let plan = catalog
            .plan(TaskKind::DeleteRow, &mut state, &mut rng)
            .unwrap();
        assert!(matches!(
            plan,
            TaskPlan::Request {
                forget_on_success: Some(42),
                ..
            }
        ));
        assert!(state.contains(42));
    }

    #[test]
    fn test_tasks_needing_ids_skip_on_empty_set() {
        let (catalog, mut state, mut rng) = setup();
        for kind in TaskKind::ALL.into_iter().filter(|k| k.requires_known_resource()) {
            assert_eq!(
                catalog.plan(kind, &mut state, &mut rng).unwrap(),
                TaskPlan::Skip
            );
        }
        assert_eq!(
            catalog.plan(TaskKind::Stop, &mut state, &mut rng).unwrap(),
            TaskPlan::Stop
        );
    }

    #[test]
    fn test_paginated_and_update_requests() {
        let (catalog, mut state, mut rng) = setup();
        state.set_auth_token("tok".into()).unwrap();
        state.remember(7);

        let TaskPlan::Request { request, .. } = catalog
            .plan(TaskKind::ListRowsPaginated, &mut state, &mut rng)
            .unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(request.path, "/api/Client/7?offset=0&limit=5");
        assert_eq!(
            request.headers,
            vec![("Authorization".to_string(), "Bearer tok".to_string())]
        );

        let TaskPlan::Request { request, .. } = catalog
            .plan(TaskKind::UpdateRow, &mut state, &mut rng)
            .unwrap()
        else {
            panic!("expected request");
        };
        assert_eq!(request.method, Method::Put);
        let body = request.body.unwrap();
        assert_eq!(body["LeaderboardId"], 7);
        assert_eq!(body["ClientId"], state.client_id());
        let rating = body["Rating"].as_u64().unwrap();
        assert!((100..=99_999).contains(&rating));
    }

    #[test]
    fn test_catalog_rejects_bad_tables() {
        let mut descriptors: Vec<TaskDescriptor> = TaskKind::ALL
            .iter()
            .map(|kind| TaskDescriptor::new(*kind, 1))
            .collect();
        descriptors[2].weight = 0;
        assert!(TaskCatalog::new(descriptors.clone()).is_err());

        descriptors.truncate(3);
        assert!(TaskCatalog::new(descriptors).is_err());
    }

    #[test]
    fn test_catalog_rejects_overflowing_weights() {
        let config = TaskConfig {
            create_row: u32::MAX,
            list_rows_paginated: u32::MAX,
            ..TaskConfig::default()
        };
        let err = TaskCatalog::from_config(&config).unwrap_err().to_string();
        assert!(err.contains("sum"), "{err}");

        let descriptors: Vec<TaskDescriptor> = TaskKind::ALL
            .iter()
            .map(|kind| TaskDescriptor::new(*kind, u32::MAX / 4))
            .collect();
        assert!(TaskCatalog::new(descriptors).is_err());
    }

    #[test]
    fn test_request_body_carries_row_fields() {
        let (catalog, mut state, mut rng) = setup();
        let TaskPlan::Request { request, .. } = catalog
            .plan(TaskKind::CreateRow, &mut state, &mut rng)
            .unwrap()
        else {
            panic!("create-row must issue a request");
        };
        let body = request.body.expect("create-row sends a body");
        let object = body.as_object().unwrap();
        assert_eq!(object.len(), 3);
        for key in ["ClientId", "Rating", "LeaderboardId"] {
            assert!(object.contains_key(key), "missing {key}");
        }
    }
}
