mod bucket;
mod client;
mod gateway_info;
mod limiter;
mod request;
mod route;

pub use bucket::Bucket;
pub use bucket::BucketTable;
pub use bucket::RateLimitHeaders;
pub use bucket::GLOBAL_KEY;
pub use client::Http;
pub use client::HttpConfig;
pub use client::Reply;
pub use client::API_BASE;
pub use client::API_VERSION;
pub use gateway_info::BotGatewayInfo;
pub use gateway_info::GatewayApi;
pub use gateway_info::GatewayInfo;
pub use gateway_info::SessionStartLimit;
pub use limiter::trace_id;
pub use limiter::KeyLease;
pub use limiter::RateLimiter;
pub use limiter::RequestContext;
pub use request::Body;
pub use request::FileUpload;
pub use request::MultipartBody;
pub use request::QueryValues;
pub use request::RequestOptions;
pub use route::Method;
pub use route::Route;
pub use route::MAJOR_PARAMS;
