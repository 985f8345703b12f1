use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use super::model::{AgentInfo, AssociationPage, AssociationRawData, AssociationStatus, UpdateStatusOutput};
use super::stop_policy::StopPolicy;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ServiceError {
    /// The destination could not be reached or failed on its side.
    #[error("transport error: {0}")]
    Transport(String),

    /// The destination answered and refused the request.
    #[error("request rejected ({code}): {message}")]
    Rejected { code: u16, message: String },

    /// The stop policy is open; no request was sent.
    #[error("stop policy `{0}` is open, call skipped")]
    CircuitOpen(String),
}

/// Raw calls against the control plane. Implementations do no retrying and
/// keep no state between calls.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    async fn list_page(&self, instance_id: &str, next_token: Option<&str>) -> Result<AssociationPage, ServiceError>;

    async fn get_document(&self, name: &str, version: Option<&str>) -> Result<String, ServiceError>;

    async fn update_status(
        &self,
        instance_id: &str,
        association_name: &str,
        status: AssociationStatus,
        message: &str,
        agent_info: &AgentInfo,
    ) -> Result<UpdateStatusOutput, ServiceError>;

    fn name(&self) -> &'static str;
}

impl fmt::Debug for dyn ControlPlane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ControlPlane").field("impl", &self.name()).finish()
    }
}

#[async_trait]
pub trait AssociationServiceType: Send + Sync {
    /// Every outstanding association of an instance. Either all pages are
    /// returned or an error; never a partial list.
    async fn list_associations(&self, instance_id: &str) -> Result<Vec<AssociationRawData>, ServiceError>;

    /// Fills in the document content. Already loaded associations are left
    /// as they are.
    async fn load_association_detail(&self, association: &mut AssociationRawData) -> Result<(), ServiceError>;

    /// Reports a status, unless `stop_policy` is open.
    async fn update_association_status(
        &self,
        instance_id: &str,
        association_name: &str,
        status: AssociationStatus,
        message: &str,
        agent_info: &AgentInfo,
        stop_policy: &StopPolicy,
    ) -> Result<UpdateStatusOutput, ServiceError>;
}

/// The client over a [`ControlPlane`] transport.
#[derive(Debug, Clone)]
pub struct AssociationService {
    control_plane: Arc<dyn ControlPlane>,
}

impl AssociationService {
    pub fn new(control_plane: Arc<dyn ControlPlane>) -> Arc<Self> {
        Arc::new(Self { control_plane })
    }
}

#[async_trait]
impl AssociationServiceType for AssociationService {
    #[tracing::instrument(name = "list_associations", skip(self))]
    async fn list_associations(&self, instance_id: &str) -> Result<Vec<AssociationRawData>, ServiceError> {
        let mut associations = Vec::new();
        let mut next_token: Option<String> = None;
        loop {
            let page = self.control_plane.list_page(instance_id, next_token.as_deref()).await?;
            associations.extend(page.associations);
            match page.next_token {
                Some(token) if !token.is_empty() => {
                    if next_token.as_deref() == Some(token.as_str()) {
                        return Err(ServiceError::Transport(format!(
                            "listing for {instance_id} repeated page token {token}"
                        )));
                    }
                    next_token = Some(token);
                }
                _ => break,
            }
        }
        debug!(count = associations.len(), "listed associations");
        Ok(associations)
    }

    async fn load_association_detail(&self, association: &mut AssociationRawData) -> Result<(), ServiceError> {
        if association.is_loaded() {
            return Ok(());
        }
        let content = self
            .control_plane
            .get_document(&association.document_name, association.document_version.as_deref())
            .await?;
        association.document = Some(content);
        Ok(())
    }

    async fn update_association_status(
        &self,
        instance_id: &str,
        association_name: &str,
        status: AssociationStatus,
        message: &str,
        agent_info: &AgentInfo,
        stop_policy: &StopPolicy,
    ) -> Result<UpdateStatusOutput, ServiceError> {
        if stop_policy.is_open() {
            debug!(policy = stop_policy.name(), %association_name, "skipping status update");
            return Err(ServiceError::CircuitOpen(stop_policy.name().to_string()));
        }

        match self
            .control_plane
            .update_status(instance_id, association_name, status, message, agent_info)
            .await
        {
            Ok(output) => {
                stop_policy.record_success();
                Ok(output)
            }
            Err(ServiceError::Rejected { code, message }) => {
                // Reachable destination: the breaker only tracks connectivity.
                stop_policy.record_success();
                warn!(%association_name, code, %message, "status update rejected");
                Err(ServiceError::Rejected { code, message })
            }
            Err(e) => {
                stop_policy.record_failure();
                warn!(%association_name, error = %e, failures = stop_policy.failures(), "status update failed");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    struct ScriptedPlane {
        pages: HashMap<Option<String>, AssociationPage>,
        fail_page: Option<String>,
        update_results: Mutex<Vec<Result<UpdateStatusOutput, ServiceError>>>,
        document_calls: AtomicUsize,
        update_calls: AtomicUsize,
    }

    #[async_trait]
    impl ControlPlane for ScriptedPlane {
        async fn list_page(&self, _instance_id: &str, next_token: Option<&str>) -> Result<AssociationPage, ServiceError> {
            if next_token.is_some() && next_token == self.fail_page.as_deref() {
                return Err(ServiceError::Transport("connection reset".into()));
            }
            Ok(self.pages.get(&next_token.map(str::to_string)).cloned().unwrap_or_default())
        }

        async fn get_document(&self, name: &str, _version: Option<&str>) -> Result<String, ServiceError> {
            self.document_calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("content of {name}"))
        }

        async fn update_status(
            &self,
            _instance_id: &str,
            _association_name: &str,
            _status: AssociationStatus,
            _message: &str,
            _agent_info: &AgentInfo,
        ) -> Result<UpdateStatusOutput, ServiceError> {
            self.update_calls.fetch_add(1, Ordering::SeqCst);
            self.update_results
                .lock()
                .unwrap()
                .pop()
                .unwrap_or(Ok(UpdateStatusOutput { accepted: true, message: None }))
        }

        fn name(&self) -> &'static str {
            "ScriptedPlane"
        }
    }

    fn assoc(id: &str) -> AssociationRawData {
        AssociationRawData {
            association_id: id.into(),
            name: format!("name-{id}"),
            instance_id: "i-1".into(),
            document_name: "doc".into(),
            ..Default::default()
        }
    }

    fn two_pages() -> HashMap<Option<String>, AssociationPage> {
        HashMap::from([
            (
                None,
                AssociationPage { associations: vec![assoc("a")], next_token: Some("p2".into()) },
            ),
            (
                Some("p2".into()),
                AssociationPage { associations: vec![assoc("b")], next_token: None },
            ),
        ])
    }

    #[tokio::test]
    async fn test_list_follows_pages() {
        let plane = Arc::new(ScriptedPlane { pages: two_pages(), ..Default::default() });
        let service = AssociationService::new(plane);
        let listed = service.list_associations("i-1").await.unwrap();
        let ids: Vec<&str> = listed.iter().map(|a| a.association_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_list_is_all_or_nothing() {
        let plane = Arc::new(ScriptedPlane {
            pages: two_pages(),
            fail_page: Some("p2".into()),
            ..Default::default()
        });
        let service = AssociationService::new(plane);
        let err = service.list_associations("i-1").await.unwrap_err();
        assert!(matches!(err, ServiceError::Transport(_)));
    }

    #[tokio::test]
    async fn test_load_detail_is_idempotent() {
        let plane = Arc::new(ScriptedPlane::default());
        let service = AssociationService::new(plane.clone());
        let mut a = assoc("a");
        service.load_association_detail(&mut a).await.unwrap();
        service.load_association_detail(&mut a).await.unwrap();
        assert_eq!(a.document.as_deref(), Some("content of doc"));
        assert_eq!(plane.document_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stop_policy_gates_updates() {
        let failures = (0..3).map(|_| Err(ServiceError::Transport("down".into()))).collect();
        let plane = Arc::new(ScriptedPlane {
            update_results: Mutex::new(failures),
            ..Default::default()
        });
        let service = AssociationService::new(plane.clone());
        let policy = StopPolicy::new("cp", 3);
        let info = AgentInfo::default();

        for _ in 0..3 {
            let err = service
                .update_association_status("i-1", "n", AssociationStatus::Success, "", &info, &policy)
                .await
                .unwrap_err();
            assert!(matches!(err, ServiceError::Transport(_)));
        }
        assert!(policy.is_open());

        let err = service
            .update_association_status("i-1", "n", AssociationStatus::Success, "", &info, &policy)
            .await
            .unwrap_err();
        assert_eq!(err, ServiceError::CircuitOpen("cp".into()));
        assert_eq!(plane.update_calls.load(Ordering::SeqCst), 3);

        policy.reset();
        service
            .update_association_status("i-1", "n", AssociationStatus::Success, "", &info, &policy)
            .await
            .unwrap();
        assert_eq!(policy.failures(), 0);
    }

    #[tokio::test]
    async fn test_rejection_counts_as_reachable() {
        let plane = Arc::new(ScriptedPlane {
            update_results: Mutex::new(vec![
                Err(ServiceError::Rejected { code: 400, message: "bad status".into() }),
                Err(ServiceError::Transport("down".into())),
            ]),
            ..Default::default()
        });
        let service = AssociationService::new(plane);
        let policy = StopPolicy::new("cp", 5);
        let info = AgentInfo::default();

        // Results pop from the back: transport failure first, then the rejection.
        let _ = service
            .update_association_status("i-1", "n", AssociationStatus::Failed, "", &info, &policy)
            .await;
        assert_eq!(policy.failures(), 1);
        let err = service
            .update_association_status("i-1", "n", AssociationStatus::Failed, "", &info, &policy)
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceError::Rejected { code: 400, .. }));
        assert_eq!(policy.failures(), 0);
    }
}
