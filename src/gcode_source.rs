// src/gcode_source.rs - Pre-sliced command files as an ordered list of sendable lines
use std::path::Path;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("IO error reading '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Command source is empty")]
    Empty,
}

/// One line that will go on the wire, with the layer it starts if it is the first
/// command after a layer marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedLine {
    pub text: String,
    pub layer: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSource {
    lines: Vec<PreparedLine>,
    /// From a `;LAYER_COUNT:` header, when the slicer wrote one.
    pub layer_count: Option<u32>,
    pub name: Option<String>,
}

impl CommandSource {
    /// Build from raw text lines. Comments and blank lines are dropped; layer markers
    /// are attached to the next sendable line.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut source = CommandSource::default();
        let mut pending_layer: Option<u32> = None;
        let mut last_layer: Option<u32> = None;

        for raw in lines {
            let raw = raw.as_ref().trim();
            if let Some(comment) = raw.strip_prefix(';') {
                match parse_marker(comment.trim()) {
                    Some(Marker::Layer(n)) => pending_layer = Some(n),
                    Some(Marker::LayerChange) => {
                        let next = pending_layer.or(last_layer).map_or(0, |l| l + 1);
                        pending_layer = Some(next);
                    }
                    Some(Marker::LayerCount(n)) => source.layer_count = Some(n),
                    None => {}
                }
                continue;
            }

            let text = strip_comment(raw);
            if text.is_empty() {
                continue;
            }
            let layer = pending_layer.take();
            if layer.is_some() {
                last_layer = layer;
            }
            source.lines.push(PreparedLine {
                text: text.to_string(),
                layer,
            });
        }
        source
    }

    pub fn from_str(content: &str) -> Self {
        Self::from_lines(content.lines())
    }

    pub async fn from_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        let path = path.as_ref();
        tracing::info!("Reading G-code file: {}", path.display());
        let content = fs::read_to_string(path).await.map_err(|source| SourceError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut source = Self::from_str(&content);
        source.name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        tracing::info!(
            "Prepared {} lines ({} layers) from {}",
            source.len(),
            source.layer_count.map_or("unknown".to_string(), |n| n.to_string()),
            path.display()
        );
        Ok(source)
    }

    pub fn lines(&self) -> &[PreparedLine] {
        &self.lines
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

enum Marker {
    Layer(u32),
    LayerChange,
    LayerCount(u32),
}

fn parse_marker(comment: &str) -> Option<Marker> {
    if comment.eq_ignore_ascii_case("LAYER_CHANGE") {
        return Some(Marker::LayerChange);
    }
    if let Some(n) = comment.strip_prefix("LAYER_COUNT:") {
        return n.trim().parse().ok().map(Marker::LayerCount);
    }
    if let Some(n) = comment.strip_prefix("LAYER:") {
        return n.trim().parse().ok().map(Marker::Layer);
    }
    None
}

/// Drop a trailing `; comment` from a command line.
fn strip_comment(line: &str) -> &str {
    match line.find(';') {
        Some(i) => line[..i].trim_end(),
        None => line,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SLICED: &str = ";FLAVOR:Marlin
;LAYER_COUNT:2
M104 S200 ; hotend
M140 S60

;LAYER:0
G1 Z0.2 F3000
G1 X10 Y10 E1
;LAYER:1
G1 Z0.4
";

    #[test]
    fn test_comments_dropped_layers_attached() {
        let source = CommandSource::from_str(SLICED);
        let texts: Vec<&str> = source.lines().iter().map(|l| l.text.as_str()).collect();
        assert_eq!(
            texts,
            vec!["M104 S200", "M140 S60", "G1 Z0.2 F3000", "G1 X10 Y10 E1", "G1 Z0.4"]
        );
        assert_eq!(source.layer_count, Some(2));
        assert_eq!(source.lines()[2].layer, Some(0));
        assert_eq!(source.lines()[3].layer, None);
        assert_eq!(source.lines()[4].layer, Some(1));
    }

    #[test]
    fn test_layer_change_counts_up() {
        let source = CommandSource::from_lines([";LAYER_CHANGE", "G1 Z0.2", ";LAYER_CHANGE", "G1 Z0.4"]);
        assert_eq!(source.lines()[0].layer, Some(0));
        assert_eq!(source.lines()[1].layer, Some(1));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cube.gcode");
        std::fs::write(&path, SLICED).unwrap();
        let source = tokio_test::assert_ok!(tokio_test::block_on(CommandSource::from_file(&path)));
        assert_eq!(source.len(), 5);
        assert_eq!(source.name.as_deref(), Some("cube.gcode"));

        let missing = tokio_test::block_on(CommandSource::from_file(dir.path().join("nope.gcode")));
        let err = tokio_test::assert_err!(missing);
        assert!(matches!(err, SourceError::Io { .. }));
    }
}
