// SPDX-License-Identifier: MIT OR Apache-2.0
//! Daemon state: one instance of every kernel component, wired together.
//!
//! Persisted layout under `user_data/` follows the kernel's on-disk
//! contract (secrets, permissions, stores, units, capabilities, audit,
//! egress, pack_staging).

use crate::flows::FlowRunner;
use rumi_approval::{ApprovalManager, ImportLimits, PackImporter};
use rumi_audit::AuditLogger;
use rumi_core::config::KernelConfig;
use rumi_core::KernelError;
use rumi_egress::{EgressGate, EgressProxy, EgressSocket, GateConfig};
use rumi_exec::{CapabilityExecutor, UnitExecutor, UnitRegistry};
use rumi_grant::GrantManager;
use rumi_secrets::SecretsStore;
use rumi_store::{SharingManager, StoreRegistry};
use rumi_trust::{TrustFlavor, TrustStore};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

/// Shared state behind every route handler.
pub struct AppState {
    pub config: KernelConfig,
    pub api_token: String,

    pub audit: Arc<AuditLogger>,
    pub secrets: Arc<SecretsStore>,
    pub stores: Arc<StoreRegistry>,
    pub sharing: Arc<SharingManager>,
    pub unit_trust: Arc<TrustStore>,
    pub handler_trust: Arc<TrustStore>,
    pub capability_grants: Arc<GrantManager>,
    pub network_grants: Arc<GrantManager>,
    pub approval: Arc<ApprovalManager>,
    pub importer: Arc<PackImporter>,
    pub units: UnitRegistry,
    pub capability_executor: Arc<CapabilityExecutor>,
    pub unit_executor: Arc<UnitExecutor>,
    pub egress: Arc<EgressProxy>,
    pub egress_sockets: Mutex<HashMap<String, EgressSocket>>,

    pub flow_runner: Arc<dyn FlowRunner>,
    pub flow_semaphore: Semaphore,

    pub packs_root: PathBuf,
}

impl AppState {
    /// Build the full component graph from a [`KernelConfig`].
    pub fn initialize(
        config: KernelConfig,
        flow_runner: Arc<dyn FlowRunner>,
    ) -> Result<Arc<Self>, KernelError> {
        let root = config.user_data_dir.clone();
        std::fs::create_dir_all(&root)?;

        let audit = Arc::new(AuditLogger::new(root.join("audit")));

        let secrets = Arc::new(SecretsStore::new(
            root.join("secrets"),
            &root.join(".secrets_key"),
            config.secrets_key.as_deref(),
            config.secrets_allow_plaintext,
            config.security_mode,
            Arc::clone(&audit),
        )?);

        let stores = Arc::new(StoreRegistry::new(
            root.join("stores/stores.db"),
            root.join("stores"),
            Arc::clone(&audit),
        )?);

        let sharing_key = rumi_core::signing::generate_or_load_signing_key(
            &root.join("stores/.secret_key"),
            Some("RUMI_HMAC_SECRET"),
        )?;
        let sharing = Arc::new(SharingManager::new(
            root.join("stores/sharing.json"),
            sharing_key,
            config.require_hmac,
            Arc::clone(&audit),
        ));

        let unit_trust = Arc::new(TrustStore::new(
            root.join("units/trust/trusted_units.json"),
            TrustFlavor::Unit,
            config.trust_auto_reload,
            Arc::clone(&audit),
        ));
        unit_trust.load();
        let handler_trust = Arc::new(TrustStore::new(
            root.join("capabilities/trusted_handlers.json"),
            TrustFlavor::Handler,
            config.trust_auto_reload,
            Arc::clone(&audit),
        ));
        handler_trust.load();

        let grant_key = rumi_core::signing::generate_or_load_signing_key(
            &root.join("permissions/.secret_key"),
            Some("RUMI_HMAC_SECRET"),
        )?;
        let capability_grants = Arc::new(GrantManager::new(
            root.join("permissions/capabilities"),
            "capability",
            grant_key.clone(),
            Arc::clone(&audit),
        )?);
        let network_grants = Arc::new(GrantManager::new(
            root.join("permissions/network"),
            "network",
            grant_key,
            Arc::clone(&audit),
        )?);

        let packs_root = root.join("ecosystem");
        let approval = Arc::new(ApprovalManager::new(
            packs_root.clone(),
            root.join("approvals.json"),
            Arc::clone(&audit),
        )?);

        let importer = Arc::new(PackImporter::new(
            root.join("pack_staging"),
            ImportLimits {
                max_files: config.import_max_files,
                max_uncompressed_bytes: config.import_max_uncompressed_bytes,
                max_single_file_bytes: config.import_max_single_file_bytes,
            },
            Arc::clone(&audit),
        )?);

        let capability_executor = Arc::new(CapabilityExecutor::new(
            root.join("capabilities/handlers"),
            Arc::clone(&handler_trust),
            Arc::clone(&capability_grants),
            Arc::clone(&audit),
            config.secret_get_rate_limit,
            "python3",
        ));
        let unit_executor = Arc::new(UnitExecutor::new(
            Arc::clone(&approval),
            Arc::clone(&stores),
            Arc::clone(&unit_trust),
            Arc::clone(&capability_grants),
            Arc::clone(&audit),
            "python3",
        ));

        let gate = Arc::new(EgressGate::new(
            GateConfig {
                rate_limit_per_min: config.egress_rate_limit,
                max_response_bytes: config.max_response_bytes as u64,
                ..GateConfig::default()
            },
            Arc::clone(&network_grants),
            Arc::clone(&audit),
            packs_root.clone(),
        ));
        let egress = Arc::new(EgressProxy::new(
            root.join("egress"),
            gate,
            config.egress_socket_world_rw,
        )?);

        let api_token = match &config.api_token {
            Some(token) => token.clone(),
            None => {
                let token = uuid::Uuid::new_v4().simple().to_string();
                tracing::warn!(
                    "generated API token: {token}; set RUMI_API_TOKEN to pin it. \
                     Clients authenticate with: Authorization: Bearer <token>"
                );
                token
            }
        };

        let flow_semaphore = Semaphore::new(config.max_concurrent_flows.max(1));

        Ok(Arc::new(Self {
            api_token,
            audit,
            secrets,
            stores,
            sharing,
            unit_trust,
            handler_trust,
            capability_grants,
            network_grants,
            approval,
            importer,
            units: UnitRegistry,
            capability_executor,
            unit_executor,
            egress,
            egress_sockets: Mutex::new(HashMap::new()),
            flow_runner,
            flow_semaphore,
            packs_root,
            config,
        }))
    }

    /// Bring up the egress socket for an approved pack (idempotent).
    pub fn ensure_egress_socket(&self, pack_id: &str) -> Result<PathBuf, KernelError> {
        let mut sockets = self.egress_sockets.lock().expect("egress sockets lock");
        if let Some(existing) = sockets.get(pack_id) {
            return Ok(existing.path.clone());
        }
        let socket = self.egress.start_for_pack(pack_id)?;
        let path = socket.path.clone();
        sockets.insert(pack_id.to_string(), socket);
        Ok(path)
    }

    /// Tear down a pack's egress socket if one is up.
    pub fn drop_egress_socket(&self, pack_id: &str) {
        let mut sockets = self.egress_sockets.lock().expect("egress sockets lock");
        sockets.remove(pack_id);
    }

    /// Resolve the grant manager for a privilege type.
    pub fn grants_for(&self, permission_type: &str) -> Result<&Arc<GrantManager>, KernelError> {
        match permission_type {
            "capability" => Ok(&self.capability_grants),
            "network" => Ok(&self.network_grants),
            other => Err(KernelError::invalid(format!(
                "unknown permission type: {other}"
            ))),
        }
    }
}
