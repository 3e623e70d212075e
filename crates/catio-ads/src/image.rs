//! Process data image served under the input and output index groups.

use catio_common::config::Direction;
use catio_common::error::{AdsError, AdsErrorCode, AdsResult};

/// Input and output process data of the I/O server.
#[derive(Debug, Clone, Default)]
pub struct ProcessImage {
    /// Input data (slave → master).
    inputs: Vec<u8>,
    /// Output data (master → slave).
    outputs: Vec<u8>,
}

impl ProcessImage {
    /// Create a new process image with the specified sizes.
    #[must_use]
    pub fn new(input_size: usize, output_size: usize) -> Self {
        Self {
            inputs: vec![0; input_size],
            outputs: vec![0; output_size],
        }
    }

    /// Size of one region.
    #[must_use]
    pub fn size(&self, region: Direction) -> usize {
        self.region(region).len()
    }

    fn region(&self, region: Direction) -> &[u8] {
        match region {
            Direction::Input => &self.inputs,
            Direction::Output => &self.outputs,
        }
    }

    fn region_mut(&mut self, region: Direction) -> &mut [u8] {
        match region {
            Direction::Input => &mut self.inputs,
            Direction::Output => &mut self.outputs,
        }
    }

    /// Borrow `len` bytes at `offset`.
    ///
    /// An offset past the end is `InvalidOffset`; a range running past the
    /// end is `InvalidSize`.
    pub fn read(&self, region: Direction, offset: usize, len: usize) -> AdsResult<&[u8]> {
        let data = self.region(region);
        check_range(data.len(), offset, len)?;
        Ok(&data[offset..offset + len])
    }

    /// Overwrite bytes at `offset`.
    pub fn write(&mut self, region: Direction, offset: usize, bytes: &[u8]) -> AdsResult<()> {
        let data = self.region_mut(region);
        check_range(data.len(), offset, bytes.len())?;
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

fn check_range(size: usize, offset: usize, len: usize) -> AdsResult<()> {
    if offset > size {
        return Err(AdsError::Protocol(AdsErrorCode::InvalidOffset));
    }
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(AdsError::Protocol(AdsErrorCode::InvalidSize));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_regions() {
        let mut image = ProcessImage::new(8, 4);
        image.write(Direction::Input, 2, &[0x34, 0x12]).unwrap();
        assert_eq!(image.read(Direction::Input, 2, 2).unwrap(), &[0x34, 0x12]);

        image.write(Direction::Output, 0, &[1, 2, 3, 4]).unwrap();
        assert_eq!(image.read(Direction::Output, 0, 4).unwrap(), &[1, 2, 3, 4]);
        assert_eq!(image.size(Direction::Output), 4);
    }

    #[test]
    fn test_out_of_range() {
        let mut image = ProcessImage::new(4, 0);
        assert_eq!(
            image.read(Direction::Input, 5, 1).unwrap_err(),
            AdsError::Protocol(AdsErrorCode::InvalidOffset)
        );
        assert_eq!(
            image.read(Direction::Input, 2, 4).unwrap_err(),
            AdsError::Protocol(AdsErrorCode::InvalidSize)
        );
        assert!(image.write(Direction::Output, 0, &[1]).is_err());
        assert!(image.read(Direction::Input, 4, 0).unwrap().is_empty());
    }
}
