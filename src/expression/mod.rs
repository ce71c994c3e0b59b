//! Typed values, comparison predicates and their evaluation over raw
//! fixed-length records.

use std::cmp::Ordering;

use crate::catalog::{ColumnMeta, DataType};
use crate::error::{QuarryError, QuarryResult};

/// A typed scalar literal.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int32(i32),
    Float32(f32),
    Str(String),
}

impl Value {
    pub fn data_type(&self) -> DataType {
        match self {
            Value::Int32(_) => DataType::Int32,
            Value::Float32(_) => DataType::Float32,
            Value::Str(_) => DataType::FixedString,
        }
    }

    /// Fixed-length little-endian encoding matching a column of width
    /// `len`. Strings are NUL-padded; overlong strings are an error,
    /// never truncated.
    pub fn to_raw(&self, len: u32) -> QuarryResult<Vec<u8>> {
        match self {
            Value::Int32(v) => Ok(v.to_le_bytes().to_vec()),
            Value::Float32(v) => Ok(v.to_le_bytes().to_vec()),
            Value::Str(s) => {
                let bytes = s.as_bytes();
                if bytes.len() > len as usize {
                    return Err(QuarryError::Storage(format!(
                        "string value of length {} exceeds column width {}",
                        bytes.len(),
                        len
                    )));
                }
                let mut raw = vec![0u8; len as usize];
                raw[..bytes.len()].copy_from_slice(bytes);
                Ok(raw)
            }
        }
    }

    /// Decode a column slice back into a typed value. Trailing NULs of a
    /// fixed string are stripped for display purposes only.
    pub fn from_raw(data_type: DataType, raw: &[u8]) -> QuarryResult<Value> {
        match data_type {
            DataType::Int32 => Ok(Value::Int32(i32::from_le_bytes(slice4(raw)?))),
            DataType::Float32 => Ok(Value::Float32(f32::from_le_bytes(slice4(raw)?))),
            DataType::FixedString => {
                let end = raw.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
                String::from_utf8(raw[..end].to_vec())
                    .map(Value::Str)
                    .map_err(|e| QuarryError::Internal(format!("invalid utf8 in record: {e}")))
            }
        }
    }
}

fn slice4(raw: &[u8]) -> QuarryResult<[u8; 4]> {
    raw.get(..4)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| QuarryError::Internal("value slice shorter than 4 bytes".to_string()))
}

/// Comparison operators of a predicate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl CompOp {
    /// Operator after swapping the two sides of a comparison.
    pub fn swap(self) -> CompOp {
        match self {
            CompOp::Eq => CompOp::Eq,
            CompOp::Ne => CompOp::Ne,
            CompOp::Lt => CompOp::Gt,
            CompOp::Gt => CompOp::Lt,
            CompOp::Le => CompOp::Ge,
            CompOp::Ge => CompOp::Le,
        }
    }

    /// Apply the operator to a three-valued comparison result.
    pub fn matches(self, ord: Ordering) -> bool {
        match self {
            CompOp::Eq => ord == Ordering::Equal,
            CompOp::Ne => ord != Ordering::Equal,
            CompOp::Lt => ord == Ordering::Less,
            CompOp::Gt => ord == Ordering::Greater,
            CompOp::Le => ord != Ordering::Greater,
            CompOp::Ge => ord != Ordering::Less,
        }
    }
}

/// Reference to a column, optionally qualified by table name. An empty
/// table matches any table in the operator's column list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

impl ColumnRef {
    pub fn new(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            column: column.into(),
        }
    }
}

/// Right-hand side of a condition: a raw-encoded literal or another
/// column of the same row.
#[derive(Debug, Clone, PartialEq)]
pub enum ConditionRhs {
    Value { data_type: DataType, raw: Vec<u8> },
    Column(ColumnRef),
}

/// One AND-term of a predicate: `lhs op rhs`.
#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub lhs: ColumnRef,
    pub op: CompOp,
    pub rhs: ConditionRhs,
}

impl Condition {
    /// Bind a literal against a column, fixing the raw width to the
    /// column's declared length.
    pub fn with_value(lhs_col: &ColumnMeta, op: CompOp, value: Value) -> QuarryResult<Condition> {
        if value.data_type() != lhs_col.data_type {
            return Err(QuarryError::TypeMismatch(format!(
                "cannot compare column {} ({}) with a {} literal",
                lhs_col.name,
                lhs_col.data_type,
                value.data_type()
            )));
        }
        Ok(Condition {
            lhs: ColumnRef::new(lhs_col.table.clone(), lhs_col.name.clone()),
            op,
            rhs: ConditionRhs::Value {
                data_type: value.data_type(),
                raw: value.to_raw(lhs_col.len)?,
            },
        })
    }

    pub fn with_column(lhs: ColumnRef, op: CompOp, rhs: ColumnRef) -> Condition {
        Condition {
            lhs,
            op,
            rhs: ConditionRhs::Column(rhs),
        }
    }

    /// Normalize the condition so its left side refers to `table`,
    /// flipping the operator when the sides swap.
    pub fn oriented_to(&self, table: &str) -> QuarryResult<Condition> {
        if self.lhs.table.is_empty() || self.lhs.table == table {
            return Ok(self.clone());
        }
        match &self.rhs {
            ConditionRhs::Column(rhs_col) if rhs_col.table == table => Ok(Condition {
                lhs: rhs_col.clone(),
                op: self.op.swap(),
                rhs: ConditionRhs::Column(self.lhs.clone()),
            }),
            _ => Err(QuarryError::Execution(format!(
                "condition does not reference table {table}"
            ))),
        }
    }
}

/// Per-type comparison over raw column slices. Ints and floats compare
/// by decoded value; fixed strings by bytewise comparison over the full
/// declared length, embedded NULs included.
pub fn compare_raw(a: &[u8], b: &[u8], data_type: DataType, len: u32) -> QuarryResult<Ordering> {
    match data_type {
        DataType::Int32 => Ok(i32::from_le_bytes(slice4(a)?).cmp(&i32::from_le_bytes(slice4(b)?))),
        DataType::Float32 => {
            let fa = f32::from_le_bytes(slice4(a)?);
            let fb = f32::from_le_bytes(slice4(b)?);
            Ok(fa.partial_cmp(&fb).unwrap_or(Ordering::Equal))
        }
        DataType::FixedString => {
            let n = len as usize;
            Ok(a[..n].cmp(&b[..n]))
        }
    }
}

/// Multi-column lexicographic comparison over composite key slices,
/// restricted to the first `num_cols` columns.
pub fn compare_key_prefix(
    a: &[u8],
    b: &[u8],
    types: &[DataType],
    lens: &[u32],
    num_cols: usize,
) -> QuarryResult<Ordering> {
    let mut offset = 0usize;
    for (data_type, len) in types.iter().zip(lens.iter()).take(num_cols) {
        let width = *len as usize;
        let ord = compare_raw(&a[offset..], &b[offset..], *data_type, *len)?;
        if ord != Ordering::Equal {
            return Ok(ord);
        }
        offset += width;
    }
    Ok(Ordering::Equal)
}

/// Full composite key comparison.
pub fn compare_keys(a: &[u8], b: &[u8], types: &[DataType], lens: &[u32]) -> QuarryResult<Ordering> {
    compare_key_prefix(a, b, types, lens, types.len())
}

/// Resolve a column reference against an operator's column list.
pub fn find_col<'a>(cols: &'a [ColumnMeta], col_ref: &ColumnRef) -> QuarryResult<&'a ColumnMeta> {
    cols.iter()
        .find(|c| c.name == col_ref.column && (col_ref.table.is_empty() || c.table == col_ref.table))
        .ok_or_else(|| QuarryError::ColumnNotFound(col_ref.column.clone()))
}

/// Evaluate one condition against a raw record. The two sides must have
/// the same type; no implicit conversion.
pub fn eval_condition(cols: &[ColumnMeta], record: &[u8], cond: &Condition) -> QuarryResult<bool> {
    let lhs_col = find_col(cols, &cond.lhs)?;
    let lhs = &record[lhs_col.offset as usize..(lhs_col.offset + lhs_col.len) as usize];
    let (rhs, rhs_type): (&[u8], DataType) = match &cond.rhs {
        ConditionRhs::Value { data_type, raw } => (raw.as_slice(), *data_type),
        ConditionRhs::Column(rhs_ref) => {
            let rhs_col = find_col(cols, rhs_ref)?;
            if rhs_col.len != lhs_col.len {
                return Err(QuarryError::TypeMismatch(format!(
                    "columns {} and {} have different widths",
                    lhs_col.name, rhs_col.name
                )));
            }
            (
                &record[rhs_col.offset as usize..(rhs_col.offset + rhs_col.len) as usize],
                rhs_col.data_type,
            )
        }
    };
    if rhs_type != lhs_col.data_type {
        return Err(QuarryError::TypeMismatch(format!(
            "cannot compare {} column {} with {} operand",
            lhs_col.data_type, lhs_col.name, rhs_type
        )));
    }
    let ord = compare_raw(lhs, rhs, lhs_col.data_type, lhs_col.len)?;
    Ok(cond.op.matches(ord))
}

/// Conjunction of all conditions.
pub fn eval_conditions(
    cols: &[ColumnMeta],
    record: &[u8],
    conds: &[Condition],
) -> QuarryResult<bool> {
    for cond in conds {
        if !eval_condition(cols, record, cond)? {
            return Ok(false);
        }
    }
    Ok(true)
}
