use crate::config::{LabelsConfig, Validatable};
use image::Rgb;
use std::{
    fs::File,
    io::{self, BufRead},
};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LabelsError {
    #[error("Failed to read labels file: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid line {line}: {reason}")]
    InvalidLine { line: usize, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColorLabel {
    pub label: String,
    pub red: u8,
    pub green: u8,
    pub blue: u8,
}

impl ColorLabel {
    pub fn rgb(&self) -> Rgb<u8> {
        Rgb([self.red, self.green, self.blue])
    }
}

#[derive(Debug, Clone, Default)]
pub struct ClassLabels {
    labels: Vec<ColorLabel>,
}

impl ClassLabels {
    pub fn new(labels: Vec<ColorLabel>) -> Self {
        Self { labels }
    }

    pub fn load(labels_cfg: &LabelsConfig) -> Result<Self, LabelsError> {
        let file = File::open(labels_cfg.get_path())?;
        let labels = parse_labels(io::BufReader::new(file))?;
        tracing::info!("Loaded {} class labels", labels.len());
        Ok(Self { labels })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Caption and colour for a class id. Ids missing from the file get a
    /// generated name and a colour picked from a fixed palette.
    pub fn describe(&self, class_id: usize) -> (String, Rgb<u8>) {
        match self.labels.get(class_id) {
            Some(color_label) => (color_label.label.clone(), color_label.rgb()),
            None => (
                format!("class {}", class_id),
                FALLBACK_PALETTE[class_id % FALLBACK_PALETTE.len()],
            ),
        }
    }
}

const FALLBACK_PALETTE: [Rgb<u8>; 6] = [
    Rgb([255, 56, 56]),
    Rgb([255, 157, 151]),
    Rgb([255, 112, 31]),
    Rgb([72, 249, 10]),
    Rgb([0, 194, 255]),
    Rgb([132, 56, 255]),
];

/// Parses `label,red,green,blue` lines. Blank lines and `#` comments are skipped.
pub fn parse_labels<R: BufRead>(reader: R) -> Result<Vec<ColorLabel>, LabelsError> {
    let mut color_labels = Vec::new();

    for (index, line_result) in reader.lines().enumerate() {
        let line = line_result?;
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }

        let parts: Vec<&str> = trimmed.split(',').map(str::trim).collect();
        if parts.len() != 4 {
            return Err(LabelsError::InvalidLine {
                line: line_no,
                reason: format!("expected 4 fields, got {}", parts.len()),
            });
        }

        let channel = |value: &str, name: &str| {
            value.parse::<u8>().map_err(|_| LabelsError::InvalidLine {
                line: line_no,
                reason: format!("invalid {} value `{}`", name, value),
            })
        };

        color_labels.push(ColorLabel {
            label: parts[0].to_string(),
            red: channel(parts[1], "red")?,
            green: channel(parts[2], "green")?,
            blue: channel(parts[3], "blue")?,
        });
    }

    Ok(color_labels)
}
