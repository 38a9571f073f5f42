pub mod af_xdp;

pub use af_xdp::{
    Engine, LoopbackNic, PacketHandler, Reflector, Shutdown, Verdict, XdpConfig, XdpError,
    XdpStats, XskSocket,
};
