/* -------------------------------------------------------------------------- *\
 *                |   █████╗ ██╗   ██╗██████╗  █████╗ ███████╗ |              *
 *                |  ██╔══██╗██║   ██║██╔══██╗██╔══██╗██╔════╝ |              *
 *                |  ███████║██║   ██║██████╔╝███████║█████╗   |              *
 *                |  ██╔══██║██║   ██║██╔══██╗██╔══██║██╔══╝   |              *
 *                |  ██║  ██║╚██████╔╝██║  ██║██║  ██║███████╗ |              *
 *                |  ╚═╝  ╚═╝ ╚═════╝ ╚═╝  ╚═╝╚═╝  ╚═╝╚══════╝ |              *
 *                +--------------------------------------------+              *
 *                                                                            *
 *                         Distributed Systems Runtime                        *
 * -------------------------------------------------------------------------- *
 * Copyright 2022 - 2024, the aurae contributors                              *
 * SPDX-License-Identifier: Apache-2.0                                        *
\* -------------------------------------------------------------------------- */

#![allow(dead_code)]

use proto::deviceplugin::v1beta1::registration_server::{
    Registration, RegistrationServer,
};
use proto::deviceplugin::v1beta1::{Empty, RegisterRequest};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::net::{UnixListener, UnixStream};
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{Channel, Endpoint, Server, Uri};
use tonic::{Request, Response, Status};
use tower::service_fn;

#[macro_export]
macro_rules! assert_eventually {
    ($cond: expr $(,)?) => {
        assert_eventually!($cond, ::std::time::Duration::from_secs(5));
    };
    ($cond: expr, $timeout: expr $(,)?) => {
        let start = ::std::time::Instant::now();
        let timeout = $timeout;
        while !($cond) {
            ::tokio::time::sleep(::std::time::Duration::from_millis(10)).await;
            if start.elapsed() > timeout {
                ::core::panic!(
                    "assertion failed after {:?}: {}",
                    timeout,
                    stringify!($cond)
                );
            }
        }
    };
}

/// Fresh directory under the system temp dir.
pub fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir()
        .join(format!("alnaird-{name}-{}", uuid::Uuid::new_v4()));
    std::fs::create_dir_all(&dir).expect("failed to create scratch dir");
    dir
}

pub async fn connect_unix(path: &Path) -> Channel {
    let path = path.to_path_buf();
    Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            UnixStream::connect(path.clone())
        }))
        .await
        .expect("failed to connect")
}

/// Kubelet registration endpoint recording every request it accepts.
#[derive(Debug, Clone, Default)]
pub struct FakeKubelet {
    pub requests: Arc<Mutex<Vec<RegisterRequest>>>,
}

#[tonic::async_trait]
impl Registration for FakeKubelet {
    async fn register(
        &self,
        request: Request<RegisterRequest>,
    ) -> Result<Response<Empty>, Status> {
        let request = request.into_inner();
        if request.version != "v1beta1" {
            return Err(Status::invalid_argument("unsupported version"));
        }
        self.requests.lock().expect("lock").push(request);
        Ok(Response::new(Empty {}))
    }
}

impl FakeKubelet {
    /// Serves on `kubelet.sock` inside `dir` until the test runtime ends.
    pub fn serve(&self, dir: &Path) -> PathBuf {
        let socket = dir.join("kubelet.sock");
        let listener =
            UnixListener::bind(&socket).expect("failed to bind kubelet");
        let kubelet = self.clone();
        let _ = tokio::spawn(async move {
            Server::builder()
                .add_service(RegistrationServer::new(kubelet))
                .serve_with_incoming(UnixListenerStream::new(listener))
                .await
        });
        socket
    }

    pub fn registered(&self) -> Vec<RegisterRequest> {
        self.requests.lock().expect("lock").clone()
    }
}
