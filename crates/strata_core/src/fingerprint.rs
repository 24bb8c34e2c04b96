use sha2::{Digest, Sha256};

use crate::frame::{Column, Value};

const FIELD_SEPARATOR: u8 = 0x1e;
const NAME_SEPARATOR: u8 = 0x1f;
const NULL_MARKER: u8 = 0x00;

/// Content hash of a row projected to its payload columns, in the table's
/// declared column order. Two rows with equal checksums are treated as the
/// same row version.
pub fn row_checksum(columns: &[Column], row: &[Value]) -> String {
    let mut hasher = Sha256::new();
    for (column, cell) in columns.iter().zip(row) {
        hasher.update(column.name.as_bytes());
        hasher.update([NAME_SEPARATOR]);
        match cell {
            Value::Null => hasher.update([NULL_MARKER]),
            other => hasher.update(other.to_literal().as_bytes()),
        }
        hasher.update([FIELD_SEPARATOR]);
    }
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::row_checksum;
    use crate::frame::{Column, ColumnKind, Value};

    fn columns() -> Vec<Column> {
        vec![
            Column::new("car", ColumnKind::Text),
            Column::new("hp", ColumnKind::Integer),
        ]
    }

    #[test]
    fn checksum_is_lowercase_hex() {
        let digest = row_checksum(&columns(), &[Value::from("Mazda RX4"), Value::from(110)]);
        assert_eq!(digest.len(), 64);
        assert!(digest.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(digest, digest.to_lowercase());
    }

    #[test]
    fn checksum_is_deterministic() {
        let a = row_checksum(&columns(), &[Value::from("Datsun 710"), Value::from(93)]);
        let b = row_checksum(&columns(), &[Value::from("Datsun 710"), Value::from(93)]);
        assert_eq!(a, b);
    }

    #[test]
    fn value_changes_change_the_checksum() {
        let a = row_checksum(&columns(), &[Value::from("Mazda RX4"), Value::from(110)]);
        let b = row_checksum(&columns(), &[Value::from("Mazda RX4"), Value::from(55)]);
        assert_ne!(a, b);
    }

    #[test]
    fn null_hashes_differently_from_empty_string() {
        let null = row_checksum(&columns(), &[Value::Null, Value::from(1)]);
        let empty = row_checksum(&columns(), &[Value::from(""), Value::from(1)]);
        assert_ne!(null, empty);
    }

    #[test]
    fn declared_order_defines_the_hash() {
        let swapped = vec![
            Column::new("hp", ColumnKind::Integer),
            Column::new("car", ColumnKind::Text),
        ];
        let a = row_checksum(&columns(), &[Value::from("Mazda RX4"), Value::from(110)]);
        let b = row_checksum(&swapped, &[Value::from(110), Value::from("Mazda RX4")]);
        assert_ne!(a, b);
    }
}
