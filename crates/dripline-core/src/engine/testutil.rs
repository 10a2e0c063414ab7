//! In-memory trait implementations for engine tests.
//!
//! These back the scenario tests without a database: hash-map repositories
//! with the same claim/CAS semantics the SQLite layer provides, plus
//! recording fakes for the collaborators.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use futures_util::future::BoxFuture;
use serde_json::Value;
use uuid::Uuid;

use dripline_types::enrollment::{Enrollment, EnrollmentEvent, EnrollmentStatus};
use dripline_types::error::RepositoryError;
use dripline_types::flow::{
    DelaySpec, DelayUnit, FlowDefinition, FlowEncoding, FlowStats, FlowStatus, MessageTemplate,
    StepConfig, StepDefinition, TriggerConfig,
};
use dripline_types::subject::{
    EngagementKind, OutgoingMessage, Segment, SendReceipt, Subject, ThreadContext,
};

use crate::collaborator::{
    CollaboratorError, EngagementQuery, EngagementSource, HttpCallRequest, HttpCallResponse,
    HttpCaller, MessagingCollaborator, SegmentCollaborator,
};
use crate::repository::enrollment::EnrollmentRepository;
use crate::repository::flow::FlowRepository;
use crate::repository::subject::SubjectRepository;

// ---------------------------------------------------------------------------
// Definition builders
// ---------------------------------------------------------------------------

pub fn linear_flow(steps: Vec<StepDefinition>) -> FlowDefinition {
    linear_flow_with_trigger(steps, TriggerConfig::Manual {})
}

pub fn linear_flow_with_trigger(
    steps: Vec<StepDefinition>,
    trigger: TriggerConfig,
) -> FlowDefinition {
    let now = Utc::now();
    FlowDefinition {
        id: Uuid::now_v7(),
        name: "test-flow".to_string(),
        description: None,
        version: 1,
        status: FlowStatus::Active,
        trigger,
        encoding: FlowEncoding::Linear { steps },
        created_at: now,
        updated_at: now,
    }
}

pub fn message_step(id: &str, subject: &str, body: &str) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        config: StepConfig::Message {
            subject: subject.to_string(),
            body: body.to_string(),
            template_id: None,
            continue_thread: false,
            send_only_if_no_reply: false,
            skip_if_opened: false,
        },
        next_step_id: None,
    }
}

pub fn delay_step(id: &str, amount: i64, unit: DelayUnit) -> StepDefinition {
    StepDefinition {
        id: id.to_string(),
        name: id.to_string(),
        config: StepConfig::Delay {
            delay: DelaySpec::Interval { amount, unit },
        },
        next_step_id: None,
    }
}

// ---------------------------------------------------------------------------
// MemFlows
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemFlows {
    defs: Mutex<HashMap<Uuid, FlowDefinition>>,
    templates: Mutex<HashMap<Uuid, MessageTemplate>>,
}

impl MemFlows {
    pub fn seed(&self, def: FlowDefinition) -> Uuid {
        let id = def.id;
        self.defs.lock().unwrap().insert(id, def);
        id
    }

    pub fn seed_template(&self, template: MessageTemplate) {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id, template);
    }
}

impl FlowRepository for MemFlows {
    async fn save_definition(&self, def: &FlowDefinition) -> Result<(), RepositoryError> {
        self.defs.lock().unwrap().insert(def.id, def.clone());
        Ok(())
    }

    async fn get_definition(&self, id: &Uuid) -> Result<Option<FlowDefinition>, RepositoryError> {
        Ok(self.defs.lock().unwrap().get(id).cloned())
    }

    async fn list_definitions(
        &self,
        status: Option<FlowStatus>,
    ) -> Result<Vec<FlowDefinition>, RepositoryError> {
        Ok(self
            .defs
            .lock()
            .unwrap()
            .values()
            .filter(|d| status.is_none_or(|s| d.status == s))
            .cloned()
            .collect())
    }

    async fn set_status(&self, id: &Uuid, status: FlowStatus) -> Result<(), RepositoryError> {
        match self.defs.lock().unwrap().get_mut(id) {
            Some(def) => {
                def.status = status;
                Ok(())
            }
            None => Err(RepositoryError::NotFound),
        }
    }

    async fn delete_definition(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self.defs.lock().unwrap().remove(id).is_some())
    }

    async fn save_template(&self, template: &MessageTemplate) -> Result<(), RepositoryError> {
        self.templates
            .lock()
            .unwrap()
            .insert(template.id, template.clone());
        Ok(())
    }

    async fn get_template(&self, id: &Uuid) -> Result<Option<MessageTemplate>, RepositoryError> {
        Ok(self.templates.lock().unwrap().get(id).cloned())
    }
}

// ---------------------------------------------------------------------------
// MemSubjects
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemSubjects {
    subjects: Mutex<HashMap<Uuid, Subject>>,
    list_members: Mutex<HashSet<(Uuid, Uuid)>>,
    segments: Mutex<HashMap<Uuid, Segment>>,
}

impl MemSubjects {
    pub fn seed(&self, email: &str, attributes: Value) -> Subject {
        self.seed_at(email, attributes, Utc::now())
    }

    pub fn seed_at(&self, email: &str, attributes: Value, created_at: DateTime<Utc>) -> Subject {
        let subject = Subject {
            id: Uuid::now_v7(),
            email: email.to_string(),
            attributes: attributes.as_object().cloned().unwrap_or_default(),
            tags: vec![],
            created_at,
            updated_at: created_at,
        };
        self.subjects
            .lock()
            .unwrap()
            .insert(subject.id, subject.clone());
        subject
    }

    pub fn tags_of(&self, id: &Uuid) -> Vec<String> {
        self.subjects
            .lock()
            .unwrap()
            .get(id)
            .map(|s| s.tags.clone())
            .unwrap_or_default()
    }

    pub fn in_list(&self, subject_id: &Uuid, list_id: &Uuid) -> bool {
        self.list_members
            .lock()
            .unwrap()
            .contains(&(*subject_id, *list_id))
    }

    pub fn field_of(&self, id: &Uuid, field: &str) -> Option<Value> {
        self.subjects
            .lock()
            .unwrap()
            .get(id)
            .and_then(|s| s.attributes.get(field).cloned())
    }
}

impl SubjectRepository for MemSubjects {
    async fn insert(&self, subject: &Subject) -> Result<(), RepositoryError> {
        self.subjects
            .lock()
            .unwrap()
            .insert(subject.id, subject.clone());
        Ok(())
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Subject>, RepositoryError> {
        Ok(self.subjects.lock().unwrap().get(id).cloned())
    }

    async fn created_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        Ok(self
            .subjects
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.created_at >= since)
            .map(|s| s.id)
            .take(limit as usize)
            .collect())
    }

    async fn touched_since(
        &self,
        since: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        Ok(self
            .subjects
            .lock()
            .unwrap()
            .values()
            .filter(|s| s.updated_at >= since)
            .map(|s| s.id)
            .take(limit as usize)
            .collect())
    }

    async fn with_date_attribute_between(
        &self,
        attribute: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Uuid>, RepositoryError> {
        Ok(self
            .subjects
            .lock()
            .unwrap()
            .values()
            .filter(|s| {
                s.attributes
                    .get(attribute)
                    .and_then(parse_date_value)
                    .is_some_and(|d| d >= from && d <= to)
            })
            .map(|s| s.id)
            .take(limit as usize)
            .collect())
    }

    async fn add_tag(&self, id: &Uuid, tag: &str) -> Result<(), RepositoryError> {
        let mut subjects = self.subjects.lock().unwrap();
        let subject = subjects.get_mut(id).ok_or(RepositoryError::NotFound)?;
        if !subject.tags.iter().any(|t| t == tag) {
            subject.tags.push(tag.to_string());
            subject.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn remove_tag(&self, id: &Uuid, tag: &str) -> Result<(), RepositoryError> {
        let mut subjects = self.subjects.lock().unwrap();
        let subject = subjects.get_mut(id).ok_or(RepositoryError::NotFound)?;
        subject.tags.retain(|t| t != tag);
        Ok(())
    }

    async fn add_to_list(&self, id: &Uuid, list_id: &Uuid) -> Result<(), RepositoryError> {
        self.list_members.lock().unwrap().insert((*id, *list_id));
        Ok(())
    }

    async fn remove_from_list(&self, id: &Uuid, list_id: &Uuid) -> Result<(), RepositoryError> {
        self.list_members.lock().unwrap().remove(&(*id, *list_id));
        Ok(())
    }

    async fn set_field(&self, id: &Uuid, field: &str, value: &str) -> Result<(), RepositoryError> {
        let mut subjects = self.subjects.lock().unwrap();
        let subject = subjects.get_mut(id).ok_or(RepositoryError::NotFound)?;
        subject
            .attributes
            .insert(field.to_string(), Value::String(value.to_string()));
        subject.updated_at = Utc::now();
        Ok(())
    }

    async fn save_segment(&self, segment: &Segment) -> Result<(), RepositoryError> {
        self.segments
            .lock()
            .unwrap()
            .insert(segment.id, segment.clone());
        Ok(())
    }

    async fn get_segment(&self, id: &Uuid) -> Result<Option<Segment>, RepositoryError> {
        Ok(self.segments.lock().unwrap().get(id).cloned())
    }
}

fn parse_date_value(value: &Value) -> Option<DateTime<Utc>> {
    let raw = value.as_str()?;
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    let date = raw.parse::<NaiveDate>().ok()?;
    Some(date.and_time(NaiveTime::MIN).and_utc())
}

// ---------------------------------------------------------------------------
// MemEnrollments
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemEnrollments {
    rows: Mutex<HashMap<Uuid, Enrollment>>,
    events: Mutex<Vec<EnrollmentEvent>>,
    stats: Mutex<HashMap<Uuid, FlowStats>>,
}

impl MemEnrollments {
    pub fn events_for(&self, enrollment_id: &Uuid) -> Vec<EnrollmentEvent> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| &e.enrollment_id == enrollment_id)
            .cloned()
            .collect()
    }
}

impl EnrollmentRepository for MemEnrollments {
    async fn create(&self, enrollment: &Enrollment) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let exists = rows
            .values()
            .any(|e| e.flow_id == enrollment.flow_id && e.subject_id == enrollment.subject_id);
        if exists {
            return Ok(false);
        }
        rows.insert(enrollment.id, enrollment.clone());
        Ok(true)
    }

    async fn get(&self, id: &Uuid) -> Result<Option<Enrollment>, RepositoryError> {
        Ok(self.rows.lock().unwrap().get(id).cloned())
    }

    async fn find(
        &self,
        flow_id: &Uuid,
        subject_id: &Uuid,
    ) -> Result<Option<Enrollment>, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .find(|e| &e.flow_id == flow_id && &e.subject_id == subject_id)
            .cloned())
    }

    async fn list_by_flow(
        &self,
        flow_id: &Uuid,
        limit: u32,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        let mut out: Vec<Enrollment> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|e| &e.flow_id == flow_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn load_ready(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Enrollment>, RepositoryError> {
        let mut out: Vec<Enrollment> = self
            .rows
            .lock()
            .unwrap()
            .values()
            .filter(|e| is_ready(e, now))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
        out.truncate(limit as usize);
        Ok(out)
    }

    async fn claim(
        &self,
        id: &Uuid,
        lease_until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<Enrollment>, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(id) else {
            return Ok(None);
        };
        if !is_ready(row, now) {
            return Ok(None);
        }
        row.claimed_until = Some(lease_until);
        Ok(Some(row.clone()))
    }

    async fn release(&self, id: &Uuid) -> Result<(), RepositoryError> {
        if let Some(row) = self.rows.lock().unwrap().get_mut(id) {
            row.claimed_until = None;
        }
        Ok(())
    }

    async fn update(
        &self,
        enrollment: &Enrollment,
        expected_version: i64,
    ) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(&enrollment.id) else {
            return Err(RepositoryError::NotFound);
        };
        if row.version != expected_version {
            return Ok(false);
        }
        let mut updated = enrollment.clone();
        updated.version = expected_version + 1;
        updated.claimed_until = None;
        *row = updated;
        Ok(true)
    }

    async fn pause(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(id) else {
            return Ok(false);
        };
        if !matches!(
            row.status,
            EnrollmentStatus::Active | EnrollmentStatus::Waiting
        ) {
            return Ok(false);
        }
        row.status = EnrollmentStatus::Paused;
        // A pending Delay re-derives its deadline from the anchor on
        // resume, so the wait pointer can drop with the status.
        row.wait_until = None;
        row.paused_at = Some(now);
        row.updated_at = now;
        row.version += 1;
        Ok(true)
    }

    async fn resume(&self, id: &Uuid, now: DateTime<Utc>) -> Result<bool, RepositoryError> {
        let mut rows = self.rows.lock().unwrap();
        let Some(row) = rows.get_mut(id) else {
            return Ok(false);
        };
        if row.status != EnrollmentStatus::Paused {
            return Ok(false);
        }
        row.status = EnrollmentStatus::Active;
        row.paused_at = None;
        row.updated_at = now;
        row.version += 1;
        Ok(true)
    }

    async fn remove(&self, id: &Uuid) -> Result<bool, RepositoryError> {
        let removed = self.rows.lock().unwrap().remove(id).is_some();
        self.events
            .lock()
            .unwrap()
            .retain(|e| &e.enrollment_id != id);
        Ok(removed)
    }

    async fn has_live_enrollments(&self, flow_id: &Uuid) -> Result<bool, RepositoryError> {
        Ok(self
            .rows
            .lock()
            .unwrap()
            .values()
            .any(|e| &e.flow_id == flow_id && !e.status.is_terminal()))
    }

    async fn filter_unenrolled(
        &self,
        flow_id: &Uuid,
        subject_ids: &[Uuid],
    ) -> Result<Vec<Uuid>, RepositoryError> {
        let rows = self.rows.lock().unwrap();
        let enrolled: HashSet<Uuid> = rows
            .values()
            .filter(|e| &e.flow_id == flow_id)
            .map(|e| e.subject_id)
            .collect();
        Ok(subject_ids
            .iter()
            .filter(|id| !enrolled.contains(id))
            .copied()
            .collect())
    }

    async fn record_event(&self, event: &EnrollmentEvent) -> Result<(), RepositoryError> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }

    async fn list_events(
        &self,
        enrollment_id: &Uuid,
    ) -> Result<Vec<EnrollmentEvent>, RepositoryError> {
        Ok(self.events_for(enrollment_id))
    }

    async fn recompute_stats(
        &self,
        flow_id: &Uuid,
        now: DateTime<Utc>,
    ) -> Result<FlowStats, RepositoryError> {
        let rows = self.rows.lock().unwrap();
        let stats = FlowStats {
            flow_id: *flow_id,
            active_count: rows
                .values()
                .filter(|e| &e.flow_id == flow_id && !e.status.is_terminal())
                .count() as i64,
            completed_count: rows
                .values()
                .filter(|e| &e.flow_id == flow_id && e.status == EnrollmentStatus::Completed)
                .count() as i64,
            updated_at: now,
        };
        self.stats.lock().unwrap().insert(*flow_id, stats.clone());
        Ok(stats)
    }

    async fn get_stats(&self, flow_id: &Uuid) -> Result<Option<FlowStats>, RepositoryError> {
        Ok(self.stats.lock().unwrap().get(flow_id).cloned())
    }
}

fn is_ready(e: &Enrollment, now: DateTime<Utc>) -> bool {
    let status_ready = match e.status {
        EnrollmentStatus::Active => true,
        EnrollmentStatus::Waiting => e.wait_until.is_some_and(|w| w <= now),
        _ => false,
    };
    let unclaimed = e.claimed_until.is_none_or(|c| c <= now);
    status_ready && unclaimed
}

// ---------------------------------------------------------------------------
// Collaborator fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct MemMessaging {
    sent: Mutex<Vec<OutgoingMessage>>,
    fail: Mutex<Option<String>>,
    thread_context: Mutex<Option<ThreadContext>>,
    counter: AtomicU64,
}

impl MemMessaging {
    pub fn sent(&self) -> Vec<OutgoingMessage> {
        self.sent.lock().unwrap().clone()
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    pub fn clear_failure(&self) {
        *self.fail.lock().unwrap() = None;
    }

    pub fn set_thread_context(&self, ctx: ThreadContext) {
        *self.thread_context.lock().unwrap() = Some(ctx);
    }
}

impl MessagingCollaborator for MemMessaging {
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> BoxFuture<'_, Result<SendReceipt, CollaboratorError>> {
        Box::pin(async move {
            if let Some(error) = self.fail.lock().unwrap().clone() {
                return Err(CollaboratorError::Transient(error));
            }
            let n = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
            let thread_id = message
                .thread_id
                .clone()
                .unwrap_or_else(|| format!("thread-{n}"));
            self.sent.lock().unwrap().push(message);
            Ok(SendReceipt {
                message_id: format!("msg-{n}"),
                thread_id,
            })
        })
    }

    fn fetch_thread_context(
        &self,
        _subject_id: Uuid,
        _thread_id: &str,
    ) -> BoxFuture<'_, Result<Option<ThreadContext>, CollaboratorError>> {
        Box::pin(async move { Ok(self.thread_context.lock().unwrap().clone()) })
    }

    fn resolve_message_identifier_header(
        &self,
        _subject_id: Uuid,
        message_id: &str,
    ) -> BoxFuture<'_, Result<Option<String>, CollaboratorError>> {
        let header = format!("hdr-{message_id}");
        Box::pin(async move { Ok(Some(header)) })
    }
}

#[derive(Default)]
pub struct MemEngagement {
    events: Mutex<Vec<(Uuid, String, EngagementKind, DateTime<Utc>)>>,
}

impl MemEngagement {
    pub fn record(
        &self,
        enrollment_id: Uuid,
        step_id: &str,
        kind: EngagementKind,
        at: DateTime<Utc>,
    ) {
        self.events
            .lock()
            .unwrap()
            .push((enrollment_id, step_id.to_string(), kind, at));
    }
}

impl EngagementSource for MemEngagement {
    fn has_engagement(
        &self,
        query: EngagementQuery,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        Box::pin(async move {
            Ok(self.events.lock().unwrap().iter().any(|(eid, step, kind, at)| {
                *eid == query.enrollment_id
                    && query.step_id.as_deref().is_none_or(|s| s == step)
                    && *kind == query.kind
                    && query.since.is_none_or(|since| *at >= since)
            }))
        })
    }
}

#[derive(Default)]
pub struct MemHttp {
    response: Mutex<Option<HttpCallResponse>>,
    fail: Mutex<Option<String>>,
    requests: Mutex<Vec<HttpCallRequest>>,
}

impl MemHttp {
    pub fn respond(&self, status: u16, body: &str) {
        *self.response.lock().unwrap() = Some(HttpCallResponse {
            status,
            headers: HashMap::new(),
            body: body.to_string(),
        });
    }

    pub fn fail_with(&self, message: &str) {
        *self.fail.lock().unwrap() = Some(message.to_string());
    }

    pub fn requests(&self) -> Vec<HttpCallRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl HttpCaller for MemHttp {
    fn call(
        &self,
        request: HttpCallRequest,
    ) -> BoxFuture<'_, Result<HttpCallResponse, CollaboratorError>> {
        Box::pin(async move {
            self.requests.lock().unwrap().push(request);
            if let Some(error) = self.fail.lock().unwrap().clone() {
                return Err(CollaboratorError::Transient(error));
            }
            Ok(self.response.lock().unwrap().clone().unwrap_or(HttpCallResponse {
                status: 200,
                headers: HashMap::new(),
                body: String::new(),
            }))
        })
    }
}

/// Segment fake that matches a fixed set of subjects.
#[derive(Default)]
pub struct MemSegments {
    matching: Mutex<HashSet<(Uuid, Uuid)>>,
}

impl MemSegments {
    pub fn set_match(&self, subject_id: Uuid, segment_id: Uuid) {
        self.matching.lock().unwrap().insert((subject_id, segment_id));
    }
}

impl SegmentCollaborator for MemSegments {
    fn matches(
        &self,
        subject_id: Uuid,
        segment_id: Uuid,
    ) -> BoxFuture<'_, Result<bool, CollaboratorError>> {
        Box::pin(async move {
            Ok(self
                .matching
                .lock()
                .unwrap()
                .contains(&(subject_id, segment_id)))
        })
    }
}
