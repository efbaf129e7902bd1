//! Stream and durable consumer provisioning.
//!
//! Subjects are grouped into stream filters (see [`subject::stream_filter_for`]) and
//! the deployment's shared stream is extended as new filters appear. A filter that an
//! existing stream already covers is used as-is; one that intersects an existing
//! stream extends that stream instead of colliding with it.
//!
//! Provisioning results are cached, so repeated calls cost a map lookup.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::broker::{BrokerAdmin, BrokerError, ConsumerSpec, StreamSpec};
use crate::consumer::ConsumerDescriptor;
use crate::subject;

/// Errors that can occur during topology provisioning.
#[derive(Debug, thiserror::Error)]
pub enum TopologyError {
    #[error("Invalid subject pattern: '{0}'")]
    InvalidSubject(String),

    #[error("Broker admin error while {operation}: {source}")]
    Admin {
        operation: &'static str,
        #[source]
        source: BrokerError,
    },
}

/// Result type for topology operations.
pub type Result<T> = std::result::Result<T, TopologyError>;

fn admin(operation: &'static str) -> impl FnOnce(BrokerError) -> TopologyError {
    move |source| TopologyError::Admin { operation, source }
}

/// Add `filter` to a subject list, dropping entries it subsumes.
fn merge_subjects(existing: &[String], filter: &str) -> Vec<String> {
    let mut merged: Vec<String> = existing
        .iter()
        .filter(|s| !subject::is_subset(s, filter))
        .cloned()
        .collect();
    merged.push(filter.to_string());
    merged
}

/// Ensures streams and durable consumers exist.
pub struct TopologyManager {
    admin: Arc<dyn BrokerAdmin>,
    stream_name: String,
    max_age: Duration,
    replicas: usize,
    /// Stream filter -> stream that carries it.
    covered: RwLock<HashMap<String, String>>,
    /// Durable name -> provisioned definition and its stream.
    consumers: RwLock<HashMap<String, (ConsumerSpec, String)>>,
    /// Serializes admin round trips so concurrent callers do not race each other.
    provisioning: Mutex<()>,
}

impl TopologyManager {
    pub fn new(admin: Arc<dyn BrokerAdmin>, stream_name: impl Into<String>) -> Self {
        Self {
            admin,
            stream_name: stream_name.into(),
            max_age: Duration::ZERO,
            replicas: 1,
            covered: RwLock::new(HashMap::new()),
            consumers: RwLock::new(HashMap::new()),
            provisioning: Mutex::new(()),
        }
    }

    /// Maximum message age for a newly created stream.
    pub fn with_max_age(mut self, max_age: Duration) -> Self {
        self.max_age = max_age;
        self
    }

    pub fn with_replicas(mut self, replicas: usize) -> Self {
        self.replicas = replicas;
        self
    }

    /// Name of the deployment's own stream.
    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    async fn cached_stream(&self, filter: &str) -> Option<String> {
        self.covered.read().await.get(filter).cloned()
    }

    /// Ensure some stream accepts `subject_or_pattern`. Returns the stream's name.
    pub async fn ensure_subject(&self, subject_or_pattern: &str) -> Result<String> {
        if !subject::is_valid(subject_or_pattern) {
            return Err(TopologyError::InvalidSubject(subject_or_pattern.to_string()));
        }
        let filter = subject::stream_filter_for(subject_or_pattern);
        if let Some(stream) = self.cached_stream(&filter).await {
            return Ok(stream);
        }

        let _guard = self.provisioning.lock().await;
        if let Some(stream) = self.cached_stream(&filter).await {
            return Ok(stream);
        }

        let stream = self.provision_filter(&filter).await?;
        self.covered.write().await.insert(filter, stream.clone());
        Ok(stream)
    }

    /// Ensure streams for several subjects or patterns.
    pub async fn ensure_stream(&self, subjects: &[String]) -> Result<Vec<String>> {
        let mut streams = Vec::with_capacity(subjects.len());
        for subject in subjects {
            streams.push(self.ensure_subject(subject).await?);
        }
        Ok(streams)
    }

    async fn provision_filter(&self, filter: &str) -> Result<String> {
        let streams = self
            .admin
            .list_streams()
            .await
            .map_err(admin("listing streams"))?;

        if let Some(existing) = streams
            .iter()
            .find(|s| s.subjects.iter().any(|s| subject::is_subset(filter, s)))
        {
            debug!(filter = %filter, stream = %existing.name, "Filter already covered");
            return Ok(existing.name.clone());
        }

        if let Some(existing) = streams
            .iter()
            .find(|s| s.subjects.iter().any(|s| subject::intersects(filter, s)))
        {
            let mut spec = existing.clone();
            spec.subjects = merge_subjects(&existing.subjects, filter);
            self.admin
                .update_stream(&spec)
                .await
                .map_err(admin("extending overlapping stream"))?;
            info!(filter = %filter, stream = %spec.name, "Extended overlapping stream");
            return Ok(spec.name);
        }

        match self.admin.stream_info(&self.stream_name).await {
            Ok(mut spec) => {
                spec.subjects = merge_subjects(&spec.subjects, filter);
                self.admin
                    .update_stream(&spec)
                    .await
                    .map_err(admin("updating stream"))?;
                info!(filter = %filter, stream = %spec.name, "Added filter to stream");
            }
            Err(e) if e.is_not_found() => {
                let spec = StreamSpec {
                    name: self.stream_name.clone(),
                    subjects: vec![filter.to_string()],
                    max_age: self.max_age,
                    replicas: self.replicas,
                };
                self.admin
                    .create_stream(&spec)
                    .await
                    .map_err(admin("creating stream"))?;
                info!(filter = %filter, stream = %spec.name, "Created stream");
            }
            Err(e) => return Err(admin("fetching stream info")(e)),
        }
        Ok(self.stream_name.clone())
    }

    /// Ensure the durable consumer for a descriptor. Returns the stream it reads from.
    pub async fn ensure_consumer(&self, descriptor: &ConsumerDescriptor) -> Result<String> {
        let spec = descriptor.consumer_spec();
        if let Some((cached, stream)) = self.consumers.read().await.get(&spec.durable_name) {
            if *cached == spec {
                return Ok(stream.clone());
            }
        }

        let stream = self.ensure_subject(&descriptor.subject_pattern).await?;

        let _guard = self.provisioning.lock().await;
        match self.admin.consumer_info(&stream, &spec.durable_name).await {
            Ok(existing) if existing == spec => {
                debug!(durable = %spec.durable_name, "Consumer already provisioned");
            }
            Ok(_) => {
                self.admin
                    .create_consumer(&stream, &spec)
                    .await
                    .map_err(admin("updating consumer"))?;
                info!(durable = %spec.durable_name, stream = %stream, "Updated consumer");
            }
            Err(e) if e.is_not_found() => {
                self.admin
                    .create_consumer(&stream, &spec)
                    .await
                    .map_err(admin("creating consumer"))?;
            }
            Err(e) => return Err(admin("fetching consumer info")(e)),
        }

        self.consumers
            .write()
            .await
            .insert(spec.durable_name.clone(), (spec, stream.clone()));
        Ok(stream)
    }

    /// Ensure every descriptor's stream and consumer. Returns the stream per descriptor.
    pub async fn ensure(&self, descriptors: &[ConsumerDescriptor]) -> Result<Vec<String>> {
        let mut streams = Vec::with_capacity(descriptors.len());
        for descriptor in descriptors {
            streams.push(self.ensure_consumer(descriptor).await?);
        }
        Ok(streams)
    }
}
