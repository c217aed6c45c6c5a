use crate::filter::{InclusionFilter, Verdict};
use crate::path::{classify, render_path, EntityKind, Segment};
use crate::stream::{Token, TokenKind};
use crate::{ExtractError, ExtractReport};
use chrono::NaiveDate;
use serde_json::{Map, Value};
use stc_core::{Project, Task};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Fields on project entities that are bulky and irrelevant downstream.
const PROJECT_NOISE_FIELDS: &[&str] = &["advancedCfg", "theme", "icon"];

#[derive(Debug)]
enum AssemblerFrame {
    Object(Map<String, Value>),
    Array(Vec<Value>),
}

/// Bottom-up generic tree construction from structural tokens. The stack
/// mirrors open containers; closing the outermost one yields the root value.
#[derive(Debug, Default)]
struct ValueAssembler {
    stack: Vec<AssemblerFrame>,
    pending_key: Option<String>,
    root: Option<Value>,
}

impl ValueAssembler {
    fn feed(&mut self, kind: &TokenKind) {
        match kind {
            TokenKind::Key(key) => self.pending_key = Some(key.clone()),
            TokenKind::StartObject => self.stack.push(AssemblerFrame::Object(Map::new())),
            TokenKind::StartArray => self.stack.push(AssemblerFrame::Array(Vec::new())),
            TokenKind::EndObject => {
                if let Some(AssemblerFrame::Object(map)) = self.stack.pop() {
                    self.attach(Value::Object(map));
                }
            }
            TokenKind::EndArray => {
                if let Some(AssemblerFrame::Array(items)) = self.stack.pop() {
                    self.attach(Value::Array(items));
                }
            }
            TokenKind::Null => self.attach(Value::Null),
            TokenKind::Bool(flag) => self.attach(Value::Bool(*flag)),
            TokenKind::Number(number) => self.attach(Value::Number(number.clone())),
            TokenKind::Str(text) => self.attach(Value::String(text.clone())),
        }
    }

    fn attach(&mut self, value: Value) {
        match self.stack.last_mut() {
            Some(AssemblerFrame::Object(map)) => {
                if let Some(key) = self.pending_key.take() {
                    map.insert(key, value);
                }
            }
            Some(AssemblerFrame::Array(items)) => items.push(value),
            None => self.root = Some(value),
        }
    }

    fn finish(self) -> Option<Value> {
        self.root
    }
}

#[derive(Debug)]
struct ActiveBuild {
    id: String,
    entry_path: Vec<Segment>,
    assembler: ValueAssembler,
    filter: InclusionFilter,
}

impl ActiveBuild {
    fn relative_path<'t>(&self, token: &'t Token) -> &'t [Segment] {
        if token.path.len() >= self.entry_path.len() {
            &token.path[self.entry_path.len()..]
        } else {
            &[]
        }
    }

    fn closes_at(&self, token: &Token) -> bool {
        matches!(token.kind, TokenKind::EndObject) && token.path == self.entry_path
    }
}

/// Single-pass entity collector. Per entity kind it is a three-state machine,
/// `Idle -> Building -> Idle`, where a second start while building is a
/// structural integrity violation rather than something to paper over.
pub struct EntityCollector {
    cutoff: Option<NaiveDate>,
    task_slot: Option<ActiveBuild>,
    project_slot: Option<ActiveBuild>,
    tasks: BTreeMap<String, Task>,
    projects: BTreeMap<String, Project>,
    report: ExtractReport,
}

impl EntityCollector {
    pub fn new(cutoff: Option<NaiveDate>) -> Self {
        Self {
            cutoff,
            task_slot: None,
            project_slot: None,
            tasks: BTreeMap::new(),
            projects: BTreeMap::new(),
            report: ExtractReport::default(),
        }
    }

    pub fn feed(&mut self, token: &Token) -> Result<(), ExtractError> {
        self.report.tokens_processed += 1;

        if matches!(token.kind, TokenKind::StartObject) {
            if let Some(matched) = classify(&token.path) {
                return self.open_entity(matched.kind, matched.id, token);
            }
        }

        if let Some(build) = self.task_slot.as_mut() {
            build.assembler.feed(&token.kind);
            let relative = build.relative_path(token);
            build.filter.observe(relative, &token.kind);
        }
        if self
            .task_slot
            .as_ref()
            .is_some_and(|build| build.closes_at(token))
        {
            if let Some(build) = self.task_slot.take() {
                self.finish_task(build);
            }
        }

        if let Some(build) = self.project_slot.as_mut() {
            build.assembler.feed(&token.kind);
            let relative = build.relative_path(token);
            build.filter.observe(relative, &token.kind);
        }
        if self
            .project_slot
            .as_ref()
            .is_some_and(|build| build.closes_at(token))
        {
            if let Some(build) = self.project_slot.take() {
                self.finish_project(build);
            }
        }

        Ok(())
    }

    fn open_entity(
        &mut self,
        kind: EntityKind,
        id: String,
        token: &Token,
    ) -> Result<(), ExtractError> {
        let slot = match kind {
            EntityKind::Task => &mut self.task_slot,
            EntityKind::Project => &mut self.project_slot,
        };
        if let Some(active) = slot {
            return Err(ExtractError::UnexpectedNesting {
                kind,
                first_id: active.id.clone(),
                second_id: id,
            });
        }

        let filter = match kind {
            EntityKind::Task => {
                self.report.tasks_seen += 1;
                InclusionFilter::for_task(self.cutoff)
            }
            EntityKind::Project => {
                self.report.projects_seen += 1;
                InclusionFilter::for_project()
            }
        };

        let mut build = ActiveBuild {
            id,
            entry_path: token.path.clone(),
            assembler: ValueAssembler::default(),
            filter,
        };
        build.assembler.feed(&token.kind);
        *slot = Some(build);
        Ok(())
    }

    fn finish_task(&mut self, build: ActiveBuild) {
        match build.filter.verdict() {
            Verdict::Retain => {}
            Verdict::DropStale => {
                debug!(event = "task_dropped_stale", task_id = %build.id);
                self.report.tasks_dropped_stale += 1;
                return;
            }
            Verdict::DropMalformed { field } => {
                warn!(event = "task_dropped_malformed", task_id = %build.id, field = %field);
                self.report.tasks_dropped_malformed += 1;
                return;
            }
        }

        let Some(value) = build.assembler.finish() else {
            warn!(event = "task_dropped_malformed", task_id = %build.id, reason = "incomplete value");
            self.report.tasks_dropped_malformed += 1;
            return;
        };
        match serde_json::from_value::<Task>(value) {
            Ok(task) => {
                self.tasks.insert(build.id, task);
                self.report.tasks_retained += 1;
            }
            Err(err) => {
                warn!(
                    event = "task_dropped_malformed",
                    task_id = %build.id,
                    path = %render_path(&build.entry_path),
                    error = %err,
                );
                self.report.tasks_dropped_malformed += 1;
            }
        }
    }

    fn finish_project(&mut self, build: ActiveBuild) {
        let Some(mut value) = build.assembler.finish() else {
            warn!(event = "project_dropped_malformed", project_id = %build.id, reason = "incomplete value");
            self.report.projects_dropped_malformed += 1;
            return;
        };
        if let Some(fields) = value.as_object_mut() {
            for noise in PROJECT_NOISE_FIELDS {
                fields.remove(*noise);
            }
        }
        match serde_json::from_value::<Project>(value) {
            Ok(mut project) => {
                if project.id.is_empty() {
                    project.id = build.id.clone();
                }
                self.projects.insert(build.id, project);
                self.report.projects_retained += 1;
            }
            Err(err) => {
                warn!(
                    event = "project_dropped_malformed",
                    project_id = %build.id,
                    error = %err,
                );
                self.report.projects_dropped_malformed += 1;
            }
        }
    }

    pub fn finish(
        self,
    ) -> (
        BTreeMap<String, Task>,
        BTreeMap<String, Project>,
        ExtractReport,
    ) {
        (self.tasks, self.projects, self.report)
    }
}
