use std::collections::BTreeMap;

use crate::catalog::{ColumnMeta, IndexMeta, TableMeta};
use crate::error::{QuarryError, QuarryResult};

/// In-memory image of the schema catalog, serialized to a text file in
/// the database directory. Tables are kept in name order so the encoding
/// is stable across open/close.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DbMeta {
    pub name: String,
    pub tables: BTreeMap<String, TableMeta>,
}

impl DbMeta {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tables: BTreeMap::new(),
        }
    }

    pub fn table(&self, name: &str) -> QuarryResult<&TableMeta> {
        self.tables
            .get(name)
            .ok_or_else(|| QuarryError::TableNotFound(name.to_string()))
    }

    pub fn table_mut(&mut self, name: &str) -> QuarryResult<&mut TableMeta> {
        self.tables
            .get_mut(name)
            .ok_or_else(|| QuarryError::TableNotFound(name.to_string()))
    }

    /// Token-oriented text serialization. Identifiers must not contain
    /// whitespace, which `Database::create_table` enforces.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("database {}\n", self.name));
        out.push_str(&format!("tables {}\n", self.tables.len()));
        for table in self.tables.values() {
            out.push_str(&format!(
                "table {} cols {} indexes {}\n",
                table.name,
                table.cols.len(),
                table.indexes.len()
            ));
            for col in &table.cols {
                out.push_str(&format!(
                    "col {} {} {} {} {}\n",
                    col.name,
                    col.data_type,
                    col.len,
                    col.offset,
                    col.indexed as u8
                ));
            }
            for index in &table.indexes {
                out.push_str(&format!(
                    "index cols {} {} tot_len {}\n",
                    index.col_names.len(),
                    index.col_names.join(" "),
                    index.col_tot_len
                ));
            }
        }
        out
    }

    pub fn decode(text: &str) -> QuarryResult<Self> {
        let mut lines = text.lines();
        let name = expect_line(&mut lines, "database")?
            .first()
            .cloned()
            .ok_or_else(|| corrupt("missing database name"))?;
        let num_tables: usize = parse_field(&expect_line(&mut lines, "tables")?, 0)?;

        let mut meta = DbMeta::new(name);
        for _ in 0..num_tables {
            let header = expect_line(&mut lines, "table")?;
            let table_name = header.first().cloned().ok_or_else(|| corrupt("table name"))?;
            let num_cols: usize = parse_field(&header, 2)?;
            let num_indexes: usize = parse_field(&header, 4)?;

            let mut cols = Vec::with_capacity(num_cols);
            for _ in 0..num_cols {
                let fields = expect_line(&mut lines, "col")?;
                if fields.len() != 5 {
                    return Err(corrupt("column line"));
                }
                cols.push(ColumnMeta {
                    table: table_name.clone(),
                    name: fields[0].clone(),
                    data_type: fields[1].parse()?,
                    len: parse_field(&fields, 2)?,
                    offset: parse_field(&fields, 3)?,
                    indexed: fields[4] == "1",
                });
            }

            let mut indexes = Vec::with_capacity(num_indexes);
            for _ in 0..num_indexes {
                let fields = expect_line(&mut lines, "index")?;
                let num_index_cols: usize = parse_field(&fields, 1)?;
                if fields.len() != num_index_cols + 4 {
                    return Err(corrupt("index line"));
                }
                let col_names: Vec<String> = fields[2..2 + num_index_cols].to_vec();
                let index_cols = col_names
                    .iter()
                    .map(|n| {
                        cols.iter()
                            .find(|c| &c.name == n)
                            .cloned()
                            .ok_or_else(|| QuarryError::ColumnNotFound(n.clone()))
                    })
                    .collect::<QuarryResult<Vec<ColumnMeta>>>()?;
                indexes.push(IndexMeta {
                    table: table_name.clone(),
                    col_tot_len: parse_field(&fields, num_index_cols + 3)?,
                    col_names,
                    cols: index_cols,
                });
            }

            meta.tables.insert(
                table_name.clone(),
                TableMeta {
                    name: table_name,
                    cols,
                    indexes,
                },
            );
        }
        Ok(meta)
    }
}

fn corrupt(what: &str) -> QuarryError {
    QuarryError::Internal(format!("corrupt catalog file: bad {what}"))
}

/// Read the next line, check its leading keyword, return the remaining
/// whitespace-separated tokens.
fn expect_line<'a>(
    lines: &mut impl Iterator<Item = &'a str>,
    keyword: &str,
) -> QuarryResult<Vec<String>> {
    let line = lines
        .next()
        .ok_or_else(|| corrupt("unexpected end of file"))?;
    let mut tokens = line.split_whitespace();
    match tokens.next() {
        Some(k) if k == keyword => Ok(tokens.map(str::to_string).collect()),
        _ => Err(corrupt(&format!("expected keyword {keyword}"))),
    }
}

fn parse_field<T: std::str::FromStr>(fields: &[String], idx: usize) -> QuarryResult<T> {
    fields
        .get(idx)
        .ok_or_else(|| corrupt("missing field"))?
        .parse()
        .map_err(|_| corrupt("numeric field"))
}
