//! Edge CSV files with `Src`, `Dst`, `Weight` columns.

use std::fs::File;
use std::path::Path;

use csv::{ReaderBuilder, StringRecord, Writer};

use crate::graph::{Edge, InstanceGraph};
use crate::util::error::{MilError, MilResult};

/// Reads an edge list for a bag of `node_count` instances.
///
/// Columns are located by header name, so an optional leading index column is ignored.
///
/// # Errors
/// [`MilError::Data`] for missing columns, unparsable values or out-of-range node ids.
pub fn read_edges(path: &Path, node_count: usize) -> MilResult<InstanceGraph> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_path(path)?;
    let headers = reader.headers()?.clone();
    let src_column = column(&headers, "Src", path)?;
    let dst_column = column(&headers, "Dst", path)?;
    let weight_column = column(&headers, "Weight", path)?;

    let mut edges = Vec::new();
    for (row, record) in reader.records().enumerate() {
        let record = record?;
        let field = |index: usize| record.get(index).unwrap_or_default().trim();
        let parse_error = |name: &str, error: &dyn std::fmt::Display| {
            MilError::data(path.display(), format!("row {row}, {name}: {error}"))
        };

        let src = field(src_column)
            .parse::<usize>()
            .map_err(|error| parse_error("Src", &error))?;
        let dst = field(dst_column)
            .parse::<usize>()
            .map_err(|error| parse_error("Dst", &error))?;
        let weight = field(weight_column)
            .parse::<f32>()
            .map_err(|error| parse_error("Weight", &error))?;
        edges.push(Edge::new(src, dst, weight));
    }

    InstanceGraph::from_edges(node_count, edges).map_err(|edge| {
        MilError::data(
            path.display(),
            format!(
                "edge {}->{} references a node outside 0..{node_count}",
                edge.src, edge.dst
            ),
        )
    })
}

/// Writes the edge list with a leading index column.
///
/// # Errors
/// I/O and CSV errors.
pub fn write_edges(path: &Path, graph: &InstanceGraph) -> MilResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = Writer::from_writer(File::create(path)?);
    writer.write_record(["", "Src", "Dst", "Weight"])?;
    for (index, edge) in graph.edges().enumerate() {
        writer.write_record([
            index.to_string(),
            edge.src.to_string(),
            edge.dst.to_string(),
            edge.weight.to_string(),
        ])?;
    }
    writer.flush()?;
    Ok(())
}

fn column(headers: &StringRecord, name: &str, path: &Path) -> MilResult<usize> {
    headers
        .iter()
        .position(|header| header.trim() == name)
        .ok_or_else(|| MilError::data(path.display(), format!("missing '{name}' column")))
}
