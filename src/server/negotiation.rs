use super::session::RequestContext;
use super::stub::{Call, Servant};
use crate::errors::{ErrorCode, RemoteException};
use crate::net::frame::RspBuf;

/// Control servant for per-connection filter negotiation.
///
/// Functions:
/// 0. `request_filters(ids) -> code`, installs a fresh chain on the session
/// 1. `query_filters(ids) -> code`, only checks support
pub(crate) struct FilterServant;

impl Servant for FilterServant {
    fn invoke(
        &self,
        ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        let (ids,): (Vec<i32>,) = call.decode_args()?;
        let code = match call.fn_id {
            0 => {
                let chain = ctx.core.filters.read().unwrap().create_chain(&ids);
                match chain {
                    Ok(chain) => {
                        info!("session {} installed filters {ids:?}", ctx.session.id);
                        ctx.session.filters = chain;
                        ErrorCode::OK
                    }
                    Err(e) => {
                        warn!("session {} refused filters {ids:?}: {e}", ctx.session.id);
                        e.code()
                    }
                }
            }
            1 => {
                if ctx.core.filters.read().unwrap().supports(&ids) {
                    ErrorCode::OK
                } else {
                    ErrorCode::UNKNOWN_FILTER
                }
            }
            _ => return Err(call.unknown_fn()),
        };
        call.encode_result(rsp, &code.0)
    }
}
