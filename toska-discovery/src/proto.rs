//! Wire messages and client stub for `toskamesh.discovery.DiscoveryRegistry`.

use std::collections::HashMap;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HealthCheckConfig {
    #[prost(string, tag = "1")]
    pub endpoint: String,
    #[prost(int32, tag = "2")]
    pub interval_seconds: i32,
    #[prost(int32, tag = "3")]
    pub timeout_seconds: i32,
    #[prost(int32, tag = "4")]
    pub unhealthy_threshold: i32,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterServiceRequest {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub service_id: String,
    #[prost(string, tag = "3")]
    pub address: String,
    #[prost(int32, tag = "4")]
    pub port: i32,
    #[prost(map = "string, string", tag = "5")]
    pub metadata: HashMap<String, String>,
    #[prost(message, optional, tag = "6")]
    pub health_check: Option<HealthCheckConfig>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct RegisterServiceResponse {
    #[prost(bool, tag = "1")]
    pub success: bool,
    #[prost(string, tag = "2")]
    pub service_id: String,
    #[prost(string, tag = "3")]
    pub error_message: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum HealthStatus {
    Unspecified = 0,
    Healthy = 1,
    Degraded = 2,
    Unhealthy = 3,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportHealthRequest {
    #[prost(string, tag = "1")]
    pub service_id: String,
    #[prost(enumeration = "HealthStatus", tag = "2")]
    pub status: i32,
    #[prost(string, tag = "3")]
    pub output: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct ReportHealthResponse {
    #[prost(bool, tag = "1")]
    pub acknowledged: bool,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeregisterServiceRequest {
    #[prost(string, tag = "1")]
    pub service_id: String,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct DeregisterServiceResponse {
    #[prost(bool, tag = "1")]
    pub removed: bool,
}

const REGISTER_PATH: &str = "/toskamesh.discovery.DiscoveryRegistry/Register";
const REPORT_HEALTH_PATH: &str = "/toskamesh.discovery.DiscoveryRegistry/ReportHealth";
const DEREGISTER_PATH: &str = "/toskamesh.discovery.DiscoveryRegistry/Deregister";

/// Unary client for the discovery registry service.
#[derive(Debug, Clone)]
pub struct DiscoveryRegistryClient {
    inner: tonic::client::Grpc<Channel>,
}

impl DiscoveryRegistryClient {
    pub fn new(channel: Channel) -> Self {
        Self {
            inner: tonic::client::Grpc::new(channel),
        }
    }

    pub async fn register(
        &mut self,
        request: RegisterServiceRequest,
    ) -> Result<RegisterServiceResponse, tonic::Status> {
        self.unary(request, REGISTER_PATH).await
    }

    pub async fn report_health(
        &mut self,
        request: ReportHealthRequest,
    ) -> Result<ReportHealthResponse, tonic::Status> {
        self.unary(request, REPORT_HEALTH_PATH).await
    }

    pub async fn deregister(
        &mut self,
        request: DeregisterServiceRequest,
    ) -> Result<DeregisterServiceResponse, tonic::Status> {
        self.unary(request, DEREGISTER_PATH).await
    }

    async fn unary<Req, Resp>(
        &mut self,
        request: Req,
        path: &'static str,
    ) -> Result<Resp, tonic::Status>
    where
        Req: ::prost::Message + Send + Sync + 'static,
        Resp: ::prost::Message + Default + Send + Sync + 'static,
    {
        self.inner
            .ready()
            .await
            .map_err(|e| tonic::Status::unavailable(format!("Service was not ready: {e}")))?;

        let codec = tonic::codec::ProstCodec::<Req, Resp>::default();
        let response = self
            .inner
            .unary(tonic::Request::new(request), PathAndQuery::from_static(path), codec)
            .await?;

        Ok(response.into_inner())
    }
}
