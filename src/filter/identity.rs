use super::{Filter, FilterDescription, Link, IDENTITY_FILTER_ID};
use crate::buffer::Buffer;
use crate::errors::Error;

static DESCRIPTION: FilterDescription = FilterDescription {
    name: "identity",
    id: IDENTITY_FILTER_ID,
    critical: false,
};

/// Passes bytes through untouched.
#[derive(Debug, Default)]
pub struct IdentityFilter;

impl Filter for IdentityFilter {
    fn description(&self) -> &'static FilterDescription {
        &DESCRIPTION
    }

    fn write(&mut self, link: &mut Link<'_>, bufs: Vec<Buffer>) -> Result<(), Error> {
        link.write(bufs);
        Ok(())
    }

    fn on_write_completed(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error> {
        link.write_completed(n);
        Ok(())
    }

    fn read(&mut self, link: &mut Link<'_>, n: usize) -> Result<(), Error> {
        link.read(n);
        Ok(())
    }

    fn on_read_completed(&mut self, link: &mut Link<'_>, buf: Buffer) -> Result<(), Error> {
        link.read_completed(buf);
        Ok(())
    }
}
