//! Reading correspondence datasets from plain text.
//!
//! The format is whitespace separated:
//!
//! ```text
//! width height num_views
//! M_0
//! x y        (M_0 image points)
//! X Y Z      (M_0 object points)
//! M_1
//! ...
//! ```

use std::path::Path;

use thiserror::Error;

use crate::types::{ImageSize, View};

/// Errors raised while loading a dataset.
#[derive(Debug, Error)]
pub enum DatasetError {
    /// The file could not be read.
    #[error("Failed to read dataset: {0}")]
    Io(#[from] std::io::Error),

    /// The content does not follow the dataset format.
    #[error("Malformed dataset at line {line}: {message}")]
    Parse {
        /// One-based line of the offending token, or the last line at end of input.
        line: usize,
        /// What was expected.
        message: String,
    },
}

/// The views of a calibration session and their frame size.
#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    /// The frame size of every view.
    pub image_size: ImageSize,
    /// The correspondences of each view.
    pub views: Vec<View>,
}

struct Tokens<'a> {
    inner: Box<dyn Iterator<Item = (usize, &'a str)> + 'a>,
    last_line: usize,
}

impl<'a> Tokens<'a> {
    fn new(content: &'a str) -> Self {
        let inner = content
            .lines()
            .enumerate()
            .flat_map(|(idx, line)| line.split_whitespace().map(move |tok| (idx + 1, tok)));
        Self {
            inner: Box::new(inner),
            last_line: 1,
        }
    }

    fn next<T: std::str::FromStr>(&mut self, what: &str) -> Result<T, DatasetError> {
        let (line, token) = self.inner.next().ok_or_else(|| DatasetError::Parse {
            line: self.last_line,
            message: format!("unexpected end of input, expected {what}"),
        })?;
        self.last_line = line;
        token.parse().map_err(|_| DatasetError::Parse {
            line,
            message: format!("expected {what}, found '{token}'"),
        })
    }

    fn next_finite(&mut self, what: &str) -> Result<f64, DatasetError> {
        let value: f64 = self.next(what)?;
        if !value.is_finite() {
            return Err(DatasetError::Parse {
                line: self.last_line,
                message: format!("{what} is not finite"),
            });
        }
        Ok(value)
    }

    fn remaining(&mut self) -> Option<(usize, &'a str)> {
        self.inner.next()
    }
}

/// Parse a dataset from its text representation.
///
/// # Errors
///
/// Returns [`DatasetError::Parse`] on a missing, malformed or trailing token.
pub fn parse_dataset(content: &str) -> Result<Dataset, DatasetError> {
    let mut tokens = Tokens::new(content);

    let width: usize = tokens.next("image width")?;
    let height: usize = tokens.next("image height")?;
    let num_views: usize = tokens.next("number of views")?;

    // counts are untrusted: storage grows with the tokens actually present
    let mut views = Vec::new();
    for view_idx in 0..num_views {
        let num_points: usize = tokens.next(&format!("point count of view {view_idx}"))?;

        let mut image_points = Vec::new();
        for _ in 0..num_points {
            let x = tokens.next_finite("image x")?;
            let y = tokens.next_finite("image y")?;
            image_points.push([x, y]);
        }

        let mut object_points = Vec::new();
        for _ in 0..num_points {
            let x = tokens.next_finite("object X")?;
            let y = tokens.next_finite("object Y")?;
            let z = tokens.next_finite("object Z")?;
            object_points.push([x, y, z]);
        }

        views.push(View {
            image_points,
            object_points,
        });
    }

    if let Some((line, token)) = tokens.remaining() {
        return Err(DatasetError::Parse {
            line,
            message: format!("unexpected trailing token '{token}'"),
        });
    }

    log::debug!("parsed dataset: {width}x{height}, {} views", views.len());

    Ok(Dataset {
        image_size: ImageSize { width, height },
        views,
    })
}

/// Read and parse a dataset file.
///
/// # Errors
///
/// Returns [`DatasetError::Io`] if the file cannot be read and
/// [`DatasetError::Parse`] if its content is malformed.
pub fn read_dataset(path: impl AsRef<Path>) -> Result<Dataset, DatasetError> {
    let content = std::fs::read_to_string(path)?;
    parse_dataset(&content)
}

/// Render a dataset in the text format read by [`parse_dataset`].
pub fn format_dataset(dataset: &Dataset) -> String {
    let mut out = format!(
        "{} {} {}\n",
        dataset.image_size.width,
        dataset.image_size.height,
        dataset.views.len()
    );
    for view in &dataset.views {
        out.push_str(&format!("{}\n", view.len()));
        for p in &view.image_points {
            out.push_str(&format!("{} {}\n", p[0], p[1]));
        }
        for p in &view.object_points {
            out.push_str(&format!("{} {} {}\n", p[0], p[1], p[2]));
        }
    }
    out
}
