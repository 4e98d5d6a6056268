use wirecall::{RemoteException, RequestContext};

/// define the Hello interface
/// this would also generate a client implementation
#[wirecall::interface]
pub trait Hello {
    /// Returns the data unchanged.
    fn echo(&self, data: String) -> String;
    /// add two u32
    fn add(&self, x: u32, y: u32) -> u32;
    /// divide, refusing zero
    fn div(&self, x: u32, y: u32) -> Result<u32, RemoteException>;
    /// id of the calling session
    fn whoami(&self, ctx: &mut RequestContext<'_>) -> u64;
    /// log a line on the server, no reply
    #[oneway]
    fn note(&self, line: String);
}

#[derive(wirecall::Servant)]
#[interface(Hello)]
pub struct HelloService;

/// implement the server
impl Hello for HelloService {
    fn echo(&self, data: String) -> String {
        data
    }

    fn add(&self, x: u32, y: u32) -> u32 {
        x + y
    }

    fn div(&self, x: u32, y: u32) -> Result<u32, RemoteException> {
        x.checked_div(y)
            .ok_or_else(|| RemoteException::user(format!("{x} / 0")))
    }

    fn whoami(&self, ctx: &mut RequestContext<'_>) -> u64 {
        ctx.session().id()
    }

    fn note(&self, line: String) {
        log::info!("note: {line}");
    }
}
