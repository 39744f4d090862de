use std::borrow::Cow;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use k8s_openapi::api::core::v1::Event;
use k8s_openapi::api::core::v1::EventSource;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::PostParams;
use kube::Api;
use kube::Client;
use kube::Resource;

use crate::error::Result;
use crate::events::types::{EventData, Reason};
use crate::events::EmitEvent;
use crate::TryResource;

/// Implementation of [EmitEvent] that creates core/v1 `Event` objects on the admin cluster.
///
/// Events about cluster-scoped objects are written into `namespace`; namespaced objects
/// get their events in their own namespace.
pub struct EventRecorder {
    client: Client,
    namespace: String,
    component: Cow<'static, str>,
}

impl EventRecorder {
    /// * `namespace` - where events about cluster-scoped objects are stored
    /// * `component` - reporting component shown in the event (e.g. "cluster-controller")
    pub fn new(client: Client, namespace: impl Into<String>, component: impl Into<Cow<'static, str>>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            component: component.into(),
        }
    }

    fn event<K, R>(&self, object: &K, event: EventData<R>, now: DateTime<Utc>) -> Result<Event>
    where
        K: Resource<DynamicType = ()> + TryResource,
        R: Reason,
    {
        let name = object.try_name()?;
        let namespace = object.meta().namespace.clone().unwrap_or_else(|| self.namespace.clone());
        let nanos = now.timestamp_nanos_opt().unwrap_or_else(|| now.timestamp());

        Ok(Event {
            metadata: ObjectMeta {
                name: Some(format!("{name}.{nanos:x}")),
                namespace: Some(namespace),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(K::api_version(&()).to_string()),
                kind: Some(K::kind(&()).to_string()),
                name: Some(name.to_owned()),
                namespace: object.meta().namespace.clone(),
                uid: object.meta().uid.to_owned(),
                resource_version: object.meta().resource_version.to_owned(),
                ..Default::default()
            },
            reason: Some(event.reason.to_string()),
            message: Some(event.message),
            type_: Some(event.type_.to_string()),
            first_timestamp: Some(Time(now)),
            last_timestamp: Some(Time(now)),
            count: Some(1),
            source: Some(EventSource {
                component: Some(self.component.to_string()),
                ..Default::default()
            }),
            reporting_component: Some(self.component.to_string()),
            action: event.action,
            ..Default::default()
        })
    }
}

#[async_trait]
impl<R> EmitEvent<R> for EventRecorder
where
    R: Reason,
{
    #[tracing::instrument(
        skip(self, object),
        fields(
            object_kind = %K::kind(&()),
            object_name = %object.try_name().unwrap_or_default(),
            event_type = %event.type_,
            event_reason = %event.reason,
        )
    )]
    async fn try_emit<K>(&self, object: &K, event: EventData<R>) -> Result<()>
    where
        K: Resource<DynamicType = ()> + TryResource + Clone + Send + Sync,
    {
        let k8s_event = self.event(object, event, Utc::now())?;
        let namespace = k8s_event.metadata.namespace.clone().unwrap_or_default();
        let events: Api<Event> = Api::namespaced(self.client.clone(), &namespace);

        events.create(&PostParams::default(), &k8s_event).await?;

        Ok(())
    }
}
