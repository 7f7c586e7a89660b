use crate::{
    error::{error_corruption, error_validation},
    meta::{BlockPointer, MetaBlockReader, MetaBlockWriter},
    node::Prefix,
    repr::{NodeRecordHeader, NodeTag, RowId},
    Error,
};

/// Terminal node holding the row ids of one fully matched key.
///
/// The prefix carries the key bytes remaining after the descent (the suffix no
/// inner node consumed). Row ids are kept sorted ascending with no duplicates.
/// A leaf is limited to `u16::MAX` row ids by the on-disk count field.
#[derive(Debug)]
pub(crate) struct Leaf {
    pub prefix: Prefix,
    pub row_ids: Vec<RowId>,
}

impl Leaf {
    pub fn new(prefix: Prefix, row: RowId) -> Self {
        Self {
            prefix,
            row_ids: vec![row],
        }
    }

    /// Returns false if the row id was already present
    pub fn insert_row(&mut self, row: RowId) -> Result<bool, Error> {
        match self.row_ids.binary_search(&row) {
            Ok(_) => Ok(false),
            Err(pos) => {
                if self.row_ids.len() >= u16::MAX as usize {
                    return Err(error_validation!(
                        "Key has more than {} row ids",
                        u16::MAX
                    ));
                }
                self.row_ids.insert(pos, row);
                Ok(true)
            }
        }
    }

    /// Returns false if the row id wasn't present
    pub fn remove_row(&mut self, row: RowId) -> bool {
        match self.row_ids.binary_search(&row) {
            Ok(pos) => {
                self.row_ids.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn serialize(&self, writer: &mut MetaBlockWriter) -> Result<BlockPointer, Error> {
        debug_assert!(self.row_ids.len() <= u16::MAX as usize);
        let pos = writer.pos()?;
        let header = NodeRecordHeader::new(
            NodeTag::Leaf,
            self.row_ids.len() as u16,
            self.prefix.len() as u32,
        );
        writer.write(zerocopy::IntoBytes::as_bytes(&header))?;
        writer.write(&self.prefix)?;
        for &row in &self.row_ids {
            writer.write_u64(row)?;
        }
        Ok(pos)
    }

    pub fn deserialize(
        reader: &mut MetaBlockReader,
        count: usize,
        prefix: Prefix,
    ) -> Result<Self, Error> {
        let mut row_ids = Vec::with_capacity(count);
        for _ in 0..count {
            row_ids.push(reader.read_u64()?);
        }
        if !row_ids.windows(2).all(|w| w[0] < w[1]) {
            return Err(error_corruption!("Leaf row ids out of order"));
        }
        Ok(Self { prefix, row_ids })
    }
}
