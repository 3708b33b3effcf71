use comfy_table::{presets, CellAlignment, ContentArrangement, Table};
use serde::Serialize;

use crate::app::GlobalOptions;

/// Prints `data` as pretty JSON under `--json`, otherwise hands it to `display_fn`.
pub fn print_output<T: Serialize>(
    data: &T,
    opts: &GlobalOptions,
    display_fn: impl FnOnce(&T),
) -> anyhow::Result<()> {
    if opts.json {
        println!("{}", serde_json::to_string_pretty(data)?);
    } else {
        display_fn(data);
    }
    Ok(())
}

#[derive(Clone, Copy)]
pub enum Align {
    Left,
    Right,
}

/// Borderless, whitespace-aligned columns for terminal output.
pub struct TabWriter {
    table: Table,
    indent: String,
}

impl TabWriter {
    /// One `(header, alignment)` pair per column.
    pub fn new(columns: &[(&str, Align)]) -> Self {
        let mut table = Table::new();
        table
            .load_preset(presets::NOTHING)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(columns.iter().map(|(name, _)| *name));

        // Two spaces between columns, none at the outer edges.
        let last = columns.len().saturating_sub(1);
        for (i, (_, align)) in columns.iter().enumerate() {
            if let Some(column) = table.column_mut(i) {
                column.set_cell_alignment(match align {
                    Align::Left => CellAlignment::Left,
                    Align::Right => CellAlignment::Right,
                });
                column.set_padding((u16::from(i != 0), u16::from(i != last)));
            }
        }

        Self {
            table,
            indent: String::new(),
        }
    }

    pub fn indent(mut self, prefix: &str) -> Self {
        self.indent = prefix.to_string();
        self
    }

    pub fn row(&mut self, values: Vec<String>) {
        self.table.add_row(values);
    }

    pub fn print(&self) {
        for line in self.table.to_string().lines() {
            println!("{}{}", self.indent, line.trim_end());
        }
    }
}
