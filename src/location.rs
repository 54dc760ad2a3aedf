use std::fmt::Display;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use miette::LabeledSpan;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Point {
    // 0-based
    pub offset: u32,
    // 0-based
    pub row: u32,
    // 0-based
    pub column: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Span {
    #[default]
    None,
    At {
        start: Point,
        end: Point,
        file: FileName,
    },
}

pub trait Spanning {
    fn span(&self) -> Span;
}

impl Span {
    pub fn len(&self) -> u32 {
        match self {
            Self::None => 0,
            Self::At { start, end, .. } => end.offset - start.offset,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn points(&self) -> Option<(Point, Point)> {
        match self {
            Self::None => None,
            Self::At { start, end, .. } => Some((*start, *end)),
        }
    }

    pub fn file(&self) -> Option<FileName> {
        match self {
            Self::None => None,
            Self::At { file, .. } => Some(file.clone()),
        }
    }

    pub fn start(&self) -> Option<Point> {
        self.points().map(|(s, _)| s)
    }

    pub fn end(&self) -> Option<Point> {
        self.points().map(|(_, e)| e)
    }

    pub fn join(&self, other: Self) -> Self {
        match (self.clone(), other) {
            (Self::None, span) | (span, Self::None) => span,
            (
                Self::At {
                    start: start1,
                    end: end1,
                    file,
                },
                Self::At {
                    start: start2,
                    end: end2,
                    ..
                },
            ) => Self::At {
                start: if start1.offset < start2.offset {
                    start1
                } else {
                    start2
                },
                end: if end1.offset > end2.offset {
                    end1
                } else {
                    end2
                },
                file,
            },
        }
    }
}

impl Display for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "<unknown>"),
            Self::At { start, file, .. } => {
                write!(f, "{}:{}:{}", file, start.row + 1, start.column + 1)
            }
        }
    }
}

impl Point {
    /// Computes the point for a byte offset into `source`.
    pub fn at_offset(source: &str, offset: usize) -> Self {
        let offset = offset.min(source.len());
        let before = &source[..offset];
        let row = before.matches('\n').count();
        let column = match before.rfind('\n') {
            Some(newline) => before[newline + 1..].chars().count(),
            None => before.chars().count(),
        };
        Point {
            offset: offset as u32,
            row: row as u32,
            column: column as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileName(pub Arc<str>);

impl FileName {
    pub fn inline() -> Self {
        FileName(Arc::from("<inline>"))
    }
}

impl Display for FileName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for FileName {
    fn from(path: &str) -> Self {
        FileName(path.into())
    }
}

impl From<String> for FileName {
    fn from(path: String) -> Self {
        FileName(path.into())
    }
}

impl From<&Path> for FileName {
    fn from(path: &Path) -> Self {
        (&*path.to_string_lossy()).into()
    }
}

impl From<PathBuf> for FileName {
    fn from(path: PathBuf) -> Self {
        path.as_path().into()
    }
}

pub fn labels_from_span(code: &str, span: &Span) -> Vec<LabeledSpan> {
    match span.points() {
        Some((start, end)) if (end.offset as usize) <= code.len() => {
            let start = start.offset as usize;
            let end = (end.offset as usize).max(start + 1).min(code.len());
            vec![LabeledSpan::underline(start..end.max(start))]
        }
        _ => vec![],
    }
}
