use std::io::Write;
use std::str;

use wirecall::{Buffer, Call, ClientStub, Endpoint, RemoteException, RequestContext, RspBuf};
use wirecall::{RpcServer, Servant};

struct Echo;

impl Servant for Echo {
    fn invoke(
        &self,
        _ctx: &mut RequestContext<'_>,
        call: &Call<'_>,
        rsp: &mut RspBuf,
    ) -> Result<(), RemoteException> {
        println!("req = {:?}", call.args);
        rsp.write_all(call.args)
            .map_err(|e| RemoteException::new(wirecall::ErrorCode::SERIALIZATION, e.to_string()))
    }
}

fn main() {
    let addr = Endpoint::tcp("127.0.0.1:4000");
    let server = RpcServer::default();
    server.bind("echo", Echo);
    let _instance = server.start(addr.clone()).unwrap();
    let mut client = ClientStub::new(addr, "echo");

    for i in 0..10 {
        let req = Buffer::from(format!("Hello World! id={i}").into_bytes());
        let rsp = client.call_raw(0, &req, false).unwrap().unwrap_or_default();
        println!("recv = {:?}", str::from_utf8(&rsp).unwrap());
    }
}
