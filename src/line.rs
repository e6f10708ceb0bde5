//! The three spice lines and their packing into one byte.

use tracing::{debug, error};

use crate::device_tree::HardwareDescription;
use crate::error::LineResolutionError;
use crate::gpio::{Level, LineId};

/// Property names of the lines, in bit order.
pub const LINE_NAMES: [&str; 3] = ["spice1-gpio", "spice2-gpio", "spice3-gpio"];

/// One physical force sensor input.
#[derive(Debug, Clone)]
pub struct Line {
    name: String,
    id: LineId,
    last_value: Option<Level>,
}

impl Line {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> LineId {
        self.id
    }

    /// Level seen by the most recent sample, if any.
    pub fn last_value(&self) -> Option<Level> {
        self.last_value
    }
}

/// The ordered lines; line `n` is bit `n` of the encoded value.
#[derive(Debug, Clone)]
pub struct LineSet {
    lines: [Line; 3],
}

impl LineSet {
    pub fn lines(&self) -> &[Line; 3] {
        &self.lines
    }

    pub fn ids(&self) -> [LineId; 3] {
        [self.lines[0].id, self.lines[1].id, self.lines[2].id]
    }

    /// Stores a fresh sample and returns its encoding.
    pub(crate) fn record(&mut self, levels: [Level; 3]) -> u8 {
        for (line, level) in self.lines.iter_mut().zip(levels) {
            line.last_value = Some(level);
        }
        encode(levels)
    }
}

/// Resolves `names` against `description`, stopping at the first failure.
///
/// Nothing outlives a failed call: the lines are only assembled into a
/// [`LineSet`] once all three resolved.
pub fn resolve(
    description: &dyn HardwareDescription,
    names: [&str; 3],
) -> Result<LineSet, LineResolutionError> {
    let resolve_one = |name: &str| -> Result<Line, LineResolutionError> {
        let id = description.named_gpio(name, 0).map_err(|source| {
            error!(name, node = %description.path(), error = %source, "unable to find GPIO in device tree");
            LineResolutionError {
                name: name.to_string(),
                node: description.path(),
                source,
            }
        })?;
        debug!(name, %id, "GPIO number found");

        Ok(Line {
            name: name.to_string(),
            id,
            last_value: None,
        })
    };

    Ok(LineSet {
        lines: [
            resolve_one(names[0])?,
            resolve_one(names[1])?,
            resolve_one(names[2])?,
        ],
    })
}

/// Packs three levels into `b2 b1 b0`, upper bits zero.
pub fn encode(levels: [Level; 3]) -> u8 {
    levels
        .iter()
        .enumerate()
        .fold(0u8, |acc, (bit, level)| acc | ((*level as u8) << bit))
}
