use std::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Key(String),
    Index(usize),
}

impl Segment {
    pub fn key(value: &str) -> Self {
        Segment::Key(value.to_string())
    }

    pub fn as_key(&self) -> Option<&str> {
        match self {
            Segment::Key(key) => Some(key.as_str()),
            Segment::Index(_) => None,
        }
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Segment::Key(key) => f.write_str(key),
            Segment::Index(index) => write!(f, "{index}"),
        }
    }
}

/// Dotted rendering of a path, for logs and error messages only.
pub fn render_path(path: &[Segment]) -> String {
    let mut out = String::new();
    for (position, segment) in path.iter().enumerate() {
        if position > 0 {
            out.push('.');
        }
        out.push_str(&segment.to_string());
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum EntityKind {
    Task,
    Project,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Task => "task",
            EntityKind::Project => "project",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMatch {
    pub kind: EntityKind,
    pub id: String,
}

/// Ids that live under the project entity map but are not real projects.
const RESERVED_PROJECT_IDS: &[&str] = &["INBOX_PROJECT"];

const PROJECT_PREFIX: &[&str] = &["mainModelData", "project", "entities"];

/// Classify a path as the root of a known entity.
///
/// Projects live at exactly `mainModelData.project.entities.<id>`. Tasks live
/// at any path whose last three segments are `task.entities.<id>`, which
/// covers the live tree as well as the `archiveYoung`/`archiveOld` prefixes.
pub fn classify(path: &[Segment]) -> Option<EntityMatch> {
    let id = path.last().and_then(Segment::as_key)?;

    if path.len() == PROJECT_PREFIX.len() + 1
        && path
            .iter()
            .zip(PROJECT_PREFIX)
            .all(|(segment, expected)| segment.as_key() == Some(expected))
        && !RESERVED_PROJECT_IDS.contains(&id)
    {
        return Some(EntityMatch {
            kind: EntityKind::Project,
            id: id.to_string(),
        });
    }

    if path.len() >= 4
        && path[path.len() - 3].as_key() == Some("task")
        && path[path.len() - 2].as_key() == Some("entities")
    {
        return Some(EntityMatch {
            kind: EntityKind::Task,
            id: id.to_string(),
        });
    }

    None
}
