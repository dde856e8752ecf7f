//! Table-properties exchange.
//!
//! The worker reports one [`TableProperties`] record per output file back to
//! the generator. The record must round-trip bit-exactly: every counter,
//! identifier string, and the two free-form string maps must come back
//! identical to what the worker sent.

use std::collections::BTreeMap;

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Wide metadata record describing one sorted-table file produced by a flush.
///
/// Field order here is also wire order for [`TableProperties::encode_to`];
/// changing it changes the wire format.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableProperties {
    /// Total size of all data blocks, in bytes.
    pub data_size: u64,
    /// Total size of the index block(s), in bytes.
    pub index_size: u64,
    /// Total size of filter blocks (e.g. bloom filters), in bytes.
    pub filter_size: u64,
    /// Sum of raw (uncompressed) key bytes.
    pub raw_key_size: u64,
    /// Sum of raw (uncompressed) value bytes.
    pub raw_value_size: u64,
    /// Number of data blocks in the file.
    pub num_data_blocks: u64,
    /// Number of entries (puts + deletes) in the file.
    pub num_entries: u64,
    /// Number of point deletions.
    pub num_deletions: u64,
    /// Number of merge operands (always 0 — no merge operator in this engine).
    pub num_merge_operands: u64,
    /// Number of range deletions.
    pub num_range_deletions: u64,
    /// Output format version of the builder that produced this file.
    pub format_version: u64,
    /// Wall-clock creation time, nanoseconds since UNIX epoch.
    pub creation_time: u64,
    /// Timestamp of the oldest key in the flush input, if tracked.
    pub oldest_key_time: u64,
    /// Filesystem-visible file creation time, nanoseconds since UNIX epoch.
    pub file_creation_time: u64,
    /// Identifier of the database that produced this file.
    pub db_id: String,
    /// Identifier of the database session that produced this file.
    pub db_session_id: String,
    /// Identifier of the host that produced this file.
    pub db_host_id: String,
    /// Column family this file belongs to.
    pub column_family_id: u64,
    /// Human-readable column family name.
    pub column_family_name: String,
    /// Name of the key comparator used.
    pub comparator_name: String,
    /// Name of the merge operator used, empty if none.
    pub merge_operator_name: String,
    /// Name of the filter policy used, empty if none.
    pub filter_policy_name: String,
    /// Name of the prefix extractor used, empty if none.
    pub prefix_extractor_name: String,
    /// Name of the compression codec applied to data blocks.
    pub compression_name: String,
    /// Opaque sequence-number-to-wall-clock-time mapping, passed through
    /// unexamined by this crate.
    pub seqno_to_time_mapping: Vec<u8>,
    /// Free-form string properties supplied by the caller (e.g. event
    /// listeners). Order is not significant; membership and values are.
    pub user_collected_properties: BTreeMap<String, String>,
    /// Free-form human-readable properties, same wire shape as
    /// `user_collected_properties` but intended for display rather than
    /// programmatic use.
    pub readable_properties: BTreeMap<String, String>,
}

fn encode_map(map: &BTreeMap<String, String>, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
    (map.len() as u32).encode_to(buf)?;
    for (k, v) in map {
        k.encode_to(buf)?;
        v.encode_to(buf)?;
    }
    Ok(())
}

fn decode_map(buf: &[u8]) -> Result<(BTreeMap<String, String>, usize), EncodingError> {
    let (count, mut off) = u32::decode_from(buf)?;
    let mut map = BTreeMap::new();
    for _ in 0..count {
        let (k, n) = String::decode_from(&buf[off..])?;
        off += n;
        let (v, n) = String::decode_from(&buf[off..])?;
        off += n;
        map.insert(k, v);
    }
    Ok((map, off))
}

impl Encode for TableProperties {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.data_size.encode_to(buf)?;
        self.index_size.encode_to(buf)?;
        self.filter_size.encode_to(buf)?;
        self.raw_key_size.encode_to(buf)?;
        self.raw_value_size.encode_to(buf)?;
        self.num_data_blocks.encode_to(buf)?;
        self.num_entries.encode_to(buf)?;
        self.num_deletions.encode_to(buf)?;
        self.num_merge_operands.encode_to(buf)?;
        self.num_range_deletions.encode_to(buf)?;
        self.format_version.encode_to(buf)?;
        self.creation_time.encode_to(buf)?;
        self.oldest_key_time.encode_to(buf)?;
        self.file_creation_time.encode_to(buf)?;
        self.db_id.encode_to(buf)?;
        self.db_session_id.encode_to(buf)?;
        self.db_host_id.encode_to(buf)?;
        self.column_family_id.encode_to(buf)?;
        self.column_family_name.encode_to(buf)?;
        self.comparator_name.encode_to(buf)?;
        self.merge_operator_name.encode_to(buf)?;
        self.filter_policy_name.encode_to(buf)?;
        self.prefix_extractor_name.encode_to(buf)?;
        self.compression_name.encode_to(buf)?;
        self.seqno_to_time_mapping.encode_to(buf)?;
        encode_map(&self.user_collected_properties, buf)?;
        encode_map(&self.readable_properties, buf)?;
        Ok(())
    }
}

impl Decode for TableProperties {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        macro_rules! field {
            ($ty:ty) => {{
                let (v, n) = <$ty>::decode_from(&buf[off..])?;
                off += n;
                v
            }};
        }

        let data_size = field!(u64);
        let index_size = field!(u64);
        let filter_size = field!(u64);
        let raw_key_size = field!(u64);
        let raw_value_size = field!(u64);
        let num_data_blocks = field!(u64);
        let num_entries = field!(u64);
        let num_deletions = field!(u64);
        let num_merge_operands = field!(u64);
        let num_range_deletions = field!(u64);
        let format_version = field!(u64);
        let creation_time = field!(u64);
        let oldest_key_time = field!(u64);
        let file_creation_time = field!(u64);
        let db_id = field!(String);
        let db_session_id = field!(String);
        let db_host_id = field!(String);
        let column_family_id = field!(u64);
        let column_family_name = field!(String);
        let comparator_name = field!(String);
        let merge_operator_name = field!(String);
        let filter_policy_name = field!(String);
        let prefix_extractor_name = field!(String);
        let compression_name = field!(String);
        let seqno_to_time_mapping = field!(Vec<u8>);
        let (user_collected_properties, n) = decode_map(&buf[off..])?;
        off += n;
        let (readable_properties, n) = decode_map(&buf[off..])?;
        off += n;

        Ok((
            Self {
                data_size,
                index_size,
                filter_size,
                raw_key_size,
                raw_value_size,
                num_data_blocks,
                num_entries,
                num_deletions,
                num_merge_operands,
                num_range_deletions,
                format_version,
                creation_time,
                oldest_key_time,
                file_creation_time,
                db_id,
                db_session_id,
                db_host_id,
                column_family_id,
                column_family_name,
                comparator_name,
                merge_operator_name,
                filter_policy_name,
                prefix_extractor_name,
                compression_name,
                seqno_to_time_mapping,
                user_collected_properties,
                readable_properties,
            },
            off,
        ))
    }
}

/// Field count used by the tagged (debug, double-check) wire variant: the 25
/// scalar fields plus the two collected-properties maps.
const TAGGED_FIELD_COUNT: u32 = 27;

impl TableProperties {
    /// Encodes this record into a freshly-allocated buffer.
    pub fn encode(&self) -> Result<Vec<u8>, EncodingError> {
        encoding::encode_to_vec(self)
    }

    /// Decodes a record previously produced by [`TableProperties::encode`].
    pub fn decode(buf: &[u8]) -> Result<Self, EncodingError> {
        let (props, _) = encoding::decode_from_slice(buf)?;
        Ok(props)
    }

    /// Encodes with a leading field count and a `u32` tag before every
    /// field, so a corrupted or mismatched decoder fails fast instead of
    /// silently misreading subsequent fields. Used when the caller opts into
    /// the slower double-check path; the production path uses
    /// [`TableProperties::encode`] instead.
    pub fn encode_tagged(&self) -> Result<Vec<u8>, EncodingError> {
        let mut buf = Vec::new();
        TAGGED_FIELD_COUNT.encode_to(&mut buf)?;
        let mut tag = 0u32;
        macro_rules! tagged {
            ($val:expr) => {{
                tag.encode_to(&mut buf)?;
                $val.encode_to(&mut buf)?;
                tag += 1;
            }};
        }
        tagged!(self.data_size);
        tagged!(self.index_size);
        tagged!(self.filter_size);
        tagged!(self.raw_key_size);
        tagged!(self.raw_value_size);
        tagged!(self.num_data_blocks);
        tagged!(self.num_entries);
        tagged!(self.num_deletions);
        tagged!(self.num_merge_operands);
        tagged!(self.num_range_deletions);
        tagged!(self.format_version);
        tagged!(self.creation_time);
        tagged!(self.oldest_key_time);
        tagged!(self.file_creation_time);
        tagged!(self.db_id);
        tagged!(self.db_session_id);
        tagged!(self.db_host_id);
        tagged!(self.column_family_id);
        tagged!(self.column_family_name);
        tagged!(self.comparator_name);
        tagged!(self.merge_operator_name);
        tagged!(self.filter_policy_name);
        tagged!(self.prefix_extractor_name);
        tagged!(self.compression_name);
        tagged!(self.seqno_to_time_mapping);
        tag.encode_to(&mut buf)?;
        encode_map(&self.user_collected_properties, &mut buf)?;
        tag += 1;
        tag.encode_to(&mut buf)?;
        encode_map(&self.readable_properties, &mut buf)?;
        Ok(buf)
    }

    /// Decodes the tagged variant produced by [`TableProperties::encode_tagged`],
    /// verifying every field's tag matches its expected position.
    pub fn decode_tagged(buf: &[u8]) -> Result<Self, EncodingError> {
        let mut off = 0;
        let (count, n) = u32::decode_from(&buf[off..])?;
        off += n;
        if count != TAGGED_FIELD_COUNT {
            return Err(EncodingError::InvalidTag {
                tag: count,
                type_name: "TableProperties::field_count",
            });
        }

        let mut expected_tag = 0u32;
        macro_rules! tagged_field {
            ($ty:ty) => {{
                let (tag, n) = u32::decode_from(&buf[off..])?;
                off += n;
                if tag != expected_tag {
                    return Err(EncodingError::InvalidTag {
                        tag,
                        type_name: "TableProperties::field",
                    });
                }
                expected_tag += 1;
                let (v, n) = <$ty>::decode_from(&buf[off..])?;
                off += n;
                v
            }};
        }

        let data_size = tagged_field!(u64);
        let index_size = tagged_field!(u64);
        let filter_size = tagged_field!(u64);
        let raw_key_size = tagged_field!(u64);
        let raw_value_size = tagged_field!(u64);
        let num_data_blocks = tagged_field!(u64);
        let num_entries = tagged_field!(u64);
        let num_deletions = tagged_field!(u64);
        let num_merge_operands = tagged_field!(u64);
        let num_range_deletions = tagged_field!(u64);
        let format_version = tagged_field!(u64);
        let creation_time = tagged_field!(u64);
        let oldest_key_time = tagged_field!(u64);
        let file_creation_time = tagged_field!(u64);
        let db_id = tagged_field!(String);
        let db_session_id = tagged_field!(String);
        let db_host_id = tagged_field!(String);
        let column_family_id = tagged_field!(u64);
        let column_family_name = tagged_field!(String);
        let comparator_name = tagged_field!(String);
        let merge_operator_name = tagged_field!(String);
        let filter_policy_name = tagged_field!(String);
        let prefix_extractor_name = tagged_field!(String);
        let compression_name = tagged_field!(String);
        let seqno_to_time_mapping = tagged_field!(Vec<u8>);

        let (tag, n) = u32::decode_from(&buf[off..])?;
        off += n;
        if tag != expected_tag {
            return Err(EncodingError::InvalidTag {
                tag,
                type_name: "TableProperties::user_collected_properties",
            });
        }
        expected_tag += 1;
        let (user_collected_properties, n) = decode_map(&buf[off..])?;
        off += n;

        let (tag, n) = u32::decode_from(&buf[off..])?;
        off += n;
        if tag != expected_tag {
            return Err(EncodingError::InvalidTag {
                tag,
                type_name: "TableProperties::readable_properties",
            });
        }
        let (readable_properties, n) = decode_map(&buf[off..])?;
        off += n;

        Ok(Self {
            data_size,
            index_size,
            filter_size,
            raw_key_size,
            raw_value_size,
            num_data_blocks,
            num_entries,
            num_deletions,
            num_merge_operands,
            num_range_deletions,
            format_version,
            creation_time,
            oldest_key_time,
            file_creation_time,
            db_id,
            db_session_id,
            db_host_id,
            column_family_id,
            column_family_name,
            comparator_name,
            merge_operator_name,
            filter_policy_name,
            prefix_extractor_name,
            compression_name,
            seqno_to_time_mapping,
            user_collected_properties,
            readable_properties,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> TableProperties {
        let mut user = BTreeMap::new();
        user.insert("a".to_string(), "1".to_string());
        user.insert("b".to_string(), "".to_string());
        TableProperties {
            data_size: 4096,
            index_size: 128,
            filter_size: 64,
            raw_key_size: 2048,
            raw_value_size: 8192,
            num_data_blocks: 3,
            num_entries: 1024,
            num_deletions: 12,
            num_merge_operands: 0,
            num_range_deletions: 2,
            format_version: 1,
            creation_time: 1_700_000_000_000_000_000,
            oldest_key_time: 1_699_999_999_000_000_000,
            file_creation_time: 1_700_000_000_500_000_000,
            db_id: "db-1".into(),
            db_session_id: "sess-1".into(),
            db_host_id: "host-1".into(),
            column_family_id: 0,
            column_family_name: "default".into(),
            comparator_name: "bytewise".into(),
            merge_operator_name: String::new(),
            filter_policy_name: "bloom".into(),
            prefix_extractor_name: String::new(),
            compression_name: "none".into(),
            seqno_to_time_mapping: vec![1, 2, 3, 4],
            user_collected_properties: user,
            readable_properties: BTreeMap::new(),
        }
    }

    #[test]
    fn round_trips_with_user_map() {
        let props = sample();
        let encoded = props.encode().unwrap();
        let decoded = TableProperties::decode(&encoded).unwrap();
        assert_eq!(props, decoded);
    }

    #[test]
    fn round_trips_empty_properties() {
        let props = TableProperties::default();
        let decoded = TableProperties::decode(&props.encode().unwrap()).unwrap();
        assert_eq!(props, decoded);
    }

    #[test]
    fn tagged_round_trip_matches_untagged() {
        let props = sample();
        let tagged = props.encode_tagged().unwrap();
        let decoded = TableProperties::decode_tagged(&tagged).unwrap();
        assert_eq!(props, decoded);
    }

    #[test]
    fn tagged_decode_rejects_truncated_field_count() {
        let props = sample();
        let mut tagged = props.encode_tagged().unwrap();
        tagged[0] = 0xFF; // corrupt the field-count prefix
        assert!(TableProperties::decode_tagged(&tagged).is_err());
    }
}
