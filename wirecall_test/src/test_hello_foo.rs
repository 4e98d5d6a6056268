pub trait Hello {
    fn echo(&self, data: String) -> String;
    fn add(&self, x: u32, y: u32) -> u32;
}

#[derive(Debug)]
pub struct HelloClient {
    stub: wirecall::ClientStub,
}

impl HelloClient {
    pub fn new<E: Into<wirecall::Endpoint>>(endpoint: E, service: &str) -> Self {
        let mut stub = wirecall::ClientStub::new(endpoint, service);
        stub.set_sub_interface("Hello");
        Self { stub }
    }

    pub fn stub_mut(&mut self) -> &mut wirecall::ClientStub {
        &mut self.stub
    }
}

impl HelloClient {
    pub fn echo(&mut self, data: String) -> Result<String, wirecall::Error> {
        // function ids follow declaration order
        self.stub.call(0, &(data,))
    }

    pub fn add(&mut self, x: u32, y: u32) -> Result<u32, wirecall::Error> {
        self.stub.call(1, &(x, y))
    }
}

pub trait HelloDispatch: Hello {
    fn dispatch(
        &self,
        call: &wirecall::Call<'_>,
        rsp: &mut wirecall::RspBuf,
    ) -> Option<Result<(), wirecall::RemoteException>> {
        if call.sub_interface != "Hello" {
            return None;
        }
        // dispatch call the service
        Some(match call.fn_id {
            0 => call
                .decode_args()
                .and_then(|(data,): (String,)| call.encode_result(rsp, &self.echo(data))),
            1 => call
                .decode_args()
                .and_then(|(x, y): (u32, u32)| call.encode_result(rsp, &self.add(x, y))),
            _ => Err(call.unknown_fn()),
        })
    }
}

impl<T: Hello> HelloDispatch for T {}

mod server {
    use super::{Hello, HelloDispatch};
    pub struct HelloService;

    impl Hello for HelloService {
        fn echo(&self, data: String) -> String {
            data
        }

        fn add(&self, x: u32, y: u32) -> u32 {
            x + y
        }
    }

    impl wirecall::Servant for HelloService {
        fn invoke(
            &self,
            ctx: &mut wirecall::RequestContext<'_>,
            call: &wirecall::Call<'_>,
            rsp: &mut wirecall::RspBuf,
        ) -> Result<(), wirecall::RemoteException> {
            log::info!(
                "session {} calls {}::{}",
                ctx.session().id(),
                call.sub_interface,
                call.fn_id
            );

            self.dispatch(call, rsp).unwrap_or_else(|| {
                Err(wirecall::RemoteException::new(
                    wirecall::ErrorCode::UNKNOWN_INTERFACE,
                    call.sub_interface,
                ))
            })
        }
    }
}

pub use server::HelloService;
