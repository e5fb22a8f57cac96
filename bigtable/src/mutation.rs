//! Row mutations, declared with the same field numbers as
//! `google.bigtable.v2.Mutation` and `MutateRowsRequest.Entry` so that
//! [`prost::Message::encoded_len`] gives their exact size on the wire.
use prost::Message;
use std::fmt;

/// Asks Bigtable to assign the cell timestamp when the write is applied.
pub const SERVER_SET_TIMESTAMP: i64 = -1;

/// One entry of a `MutateRows` request: all the changes for a single row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MutateRowsEntry {
    #[prost(bytes = "vec", tag = "1")]
    pub row_key: Vec<u8>,
    /// Applied in order. Must not be empty.
    #[prost(message, repeated, tag = "2")]
    pub mutations: Vec<Mutation>,
}

/// A change to a single cell, column, family, or row.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Mutation {
    #[prost(oneof = "mutation::Mutation", tags = "1, 2, 3, 4")]
    pub mutation: Option<mutation::Mutation>,
}

pub mod mutation {
    use super::TimestampRange;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct SetCell {
        #[prost(string, tag = "1")]
        pub family_name: String,
        #[prost(bytes = "vec", tag = "2")]
        pub column_qualifier: Vec<u8>,
        #[prost(int64, tag = "3")]
        pub timestamp_micros: i64,
        #[prost(bytes = "vec", tag = "4")]
        pub value: Vec<u8>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromColumn {
        #[prost(string, tag = "1")]
        pub family_name: String,
        #[prost(bytes = "vec", tag = "2")]
        pub column_qualifier: Vec<u8>,
        #[prost(message, optional, tag = "3")]
        pub time_range: Option<TimestampRange>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromFamily {
        #[prost(string, tag = "1")]
        pub family_name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct DeleteFromRow {}

    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Mutation {
        #[prost(message, tag = "1")]
        SetCell(SetCell),
        #[prost(message, tag = "2")]
        DeleteFromColumn(DeleteFromColumn),
        #[prost(message, tag = "3")]
        DeleteFromFamily(DeleteFromFamily),
        #[prost(message, tag = "4")]
        DeleteFromRow(DeleteFromRow),
    }
}

/// A half-open `[start, end)` range of cell timestamps. An `end` of 0 means
/// infinity.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct TimestampRange {
    #[prost(int64, tag = "1")]
    pub start_timestamp_micros: i64,
    #[prost(int64, tag = "2")]
    pub end_timestamp_micros: i64,
}

/// Writes `value` to a cell, with the timestamp assigned by the server.
pub fn set_cell(
    family: impl Into<String>,
    column: impl Into<Vec<u8>>,
    value: impl Into<Vec<u8>>,
) -> Mutation {
    set_cell_at(family, column, SERVER_SET_TIMESTAMP, value)
}

/// Writes `value` to a cell with an explicit timestamp.
pub fn set_cell_at(
    family: impl Into<String>,
    column: impl Into<Vec<u8>>,
    timestamp_micros: i64,
    value: impl Into<Vec<u8>>,
) -> Mutation {
    wrap(mutation::Mutation::SetCell(mutation::SetCell {
        family_name: family.into(),
        column_qualifier: column.into(),
        timestamp_micros,
        value: value.into(),
    }))
}

/// Deletes every cell in a column.
pub fn delete_from_column(family: impl Into<String>, column: impl Into<Vec<u8>>) -> Mutation {
    wrap(mutation::Mutation::DeleteFromColumn(
        mutation::DeleteFromColumn {
            family_name: family.into(),
            column_qualifier: column.into(),
            time_range: None,
        },
    ))
}

/// Deletes the cells in a column with timestamps in `[start, end)`.
pub fn delete_from_column_range(
    family: impl Into<String>,
    column: impl Into<Vec<u8>>,
    start_timestamp_micros: i64,
    end_timestamp_micros: i64,
) -> Mutation {
    wrap(mutation::Mutation::DeleteFromColumn(
        mutation::DeleteFromColumn {
            family_name: family.into(),
            column_qualifier: column.into(),
            time_range: Some(TimestampRange {
                start_timestamp_micros,
                end_timestamp_micros,
            }),
        },
    ))
}

pub fn delete_from_family(family: impl Into<String>) -> Mutation {
    wrap(mutation::Mutation::DeleteFromFamily(
        mutation::DeleteFromFamily {
            family_name: family.into(),
        },
    ))
}

pub fn delete_from_row() -> Mutation {
    wrap(mutation::Mutation::DeleteFromRow(mutation::DeleteFromRow {}))
}

fn wrap(mutation: mutation::Mutation) -> Mutation {
    Mutation {
        mutation: Some(mutation),
    }
}

/// A set of changes to one row, applied atomically by Bigtable.
#[derive(Clone, Default, PartialEq)]
pub struct SingleRowMutation {
    row_key: Vec<u8>,
    mutations: Vec<Mutation>,
}

impl SingleRowMutation {
    pub fn new(row_key: impl Into<Vec<u8>>) -> Self {
        Self {
            row_key: row_key.into(),
            mutations: Vec::new(),
        }
    }

    /// Appends a mutation, builder style.
    pub fn with(mut self, mutation: Mutation) -> Self {
        self.mutations.push(mutation);
        self
    }

    pub fn push(&mut self, mutation: Mutation) {
        self.mutations.push(mutation);
    }

    pub fn row_key(&self) -> &[u8] {
        &self.row_key
    }

    pub fn mutations(&self) -> &[Mutation] {
        &self.mutations
    }

    pub fn num_mutations(&self) -> usize {
        self.mutations.len()
    }

    /// The size of this row's entry in a `MutateRows` request.
    pub fn wire_size(&self) -> usize {
        // Encoding borrows nothing, so building the entry would clone the
        // whole row. Summing the fields gives the same number.
        let key_len = self.row_key.len();
        let key = if key_len == 0 {
            0
        } else {
            1 + prost::encoding::encoded_len_varint(key_len as u64) + key_len
        };
        let mutations: usize = self
            .mutations
            .iter()
            .map(|m| {
                let len = m.encoded_len();
                1 + prost::encoding::encoded_len_varint(len as u64) + len
            })
            .sum();
        key + mutations
    }

    pub fn into_entry(self) -> MutateRowsEntry {
        MutateRowsEntry {
            row_key: self.row_key,
            mutations: self.mutations,
        }
    }
}

impl From<SingleRowMutation> for MutateRowsEntry {
    fn from(mutation: SingleRowMutation) -> Self {
        mutation.into_entry()
    }
}

impl From<MutateRowsEntry> for SingleRowMutation {
    fn from(entry: MutateRowsEntry) -> Self {
        Self {
            row_key: entry.row_key,
            mutations: entry.mutations,
        }
    }
}

impl fmt::Debug for SingleRowMutation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SingleRowMutation")
            .field("row_key", &Hex(&self.row_key))
            .field("num_mutations", &self.mutations.len())
            .finish()
    }
}

struct Hex<'a>(&'a [u8]);

impl<'a> fmt::Debug for Hex<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x")?;
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use expect_test::expect;

    #[test]
    fn test_wire_size_matches_encoding() {
        let rows = [
            SingleRowMutation::new("row-1").with(set_cell("cf", "col", "value")),
            SingleRowMutation::new(vec![0u8; 300])
                .with(set_cell_at("cf", "a", 1_000, vec![7u8; 200]))
                .with(delete_from_column_range("cf", "b", 0, 2_000))
                .with(delete_from_family("old"))
                .with(delete_from_row()),
            SingleRowMutation::new(""),
        ];
        for row in rows {
            let expected = row.clone().into_entry().encoded_len();
            assert_eq!(row.wire_size(), expected, "{row:?}");
        }
    }

    #[test]
    fn test_builders() {
        let mut row = SingleRowMutation::new("r").with(delete_from_column("cf", "c"));
        row.push(set_cell("cf", "c", "v"));
        assert_eq!(row.num_mutations(), 2);
        assert_eq!(row.row_key(), b"r");
        match &row.mutations()[1].mutation {
            Some(mutation::Mutation::SetCell(cell)) => {
                assert_eq!(cell.timestamp_micros, SERVER_SET_TIMESTAMP);
                assert_eq!(cell.value, b"v");
            }
            other => panic!("unexpected mutation {other:?}"),
        }

        let entry = MutateRowsEntry::from(row.clone());
        assert_eq!(SingleRowMutation::from(entry), row);
    }

    #[test]
    fn test_debug() {
        let row = SingleRowMutation::new(vec![0xab, 0x01]).with(delete_from_row());
        expect![[r#"SingleRowMutation { row_key: 0xab01, num_mutations: 1 }"#]]
            .assert_eq(&format!("{row:?}"));
    }
}
