//! Linearization of HTML tables into pipe-delimited Markdown.

use std::sync::LazyLock;

use scraper::{ElementRef, Selector};

static ROW_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("tr").unwrap());
static CELL_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("th, td").unwrap());

/// Render a `<table>` element as a pipe table.
///
/// The first row is always the header. Short rows are padded to the widest
/// row so every line has the same number of columns. Returns an empty string
/// for tables with no cells.
pub fn table_to_markdown(table: &ElementRef) -> String {
    let mut rows: Vec<Vec<String>> = table
        .select(&ROW_SEL)
        .map(|tr| tr.select(&CELL_SEL).map(|cell| cell_text(&cell)).collect::<Vec<_>>())
        .filter(|cells| !cells.is_empty())
        .collect();

    let col_count = rows.iter().map(Vec::len).max().unwrap_or(0);
    if col_count == 0 {
        return String::new();
    }
    for row in &mut rows {
        row.resize(col_count, String::new());
    }

    let mut lines = Vec::with_capacity(rows.len() + 1);
    lines.push(format_row(&rows[0]));
    lines.push(format!("| {} |", vec!["---"; col_count].join(" | ")));
    lines.extend(rows[1..].iter().map(|row| format_row(row)));
    lines.join("\n")
}

fn format_row(cells: &[String]) -> String {
    format!("| {} |", cells.join(" | "))
}

/// Cell text with whitespace collapsed and pipes escaped.
fn cell_text(cell: &ElementRef) -> String {
    cell.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
        .replace('|', "\\|")
}
