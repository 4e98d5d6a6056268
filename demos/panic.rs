use wirecall::{Endpoint, RpcServer};

#[wirecall::interface]
trait RpcSpec {
    fn add(&self, x: u32, y: u32) -> u32;
}

#[derive(wirecall::Servant)]
#[interface(RpcSpec)]
struct RcpServer;

impl RpcSpec for RcpServer {
    fn add(&self, _x: u32, _y: u32) -> u32 {
        panic!("panic inside")
    }
}

fn main() {
    env_logger::init();
    let addr = Endpoint::tcp("127.0.0.1:4000");
    let server = RpcServer::default();
    server.bind("add", RcpServer);
    let instance = server.start(addr.clone()).unwrap();

    let mut client = RpcSpecClient::new(addr, "add");
    // the panic comes back as a BadException remote error
    println!("rsp = {:?}", client.add(1, 4));
    // and the connection is still usable
    println!("rsp = {:?}", client.add(2, 3));
    println!("done");
    drop(instance);
}
