use std::time::Duration;

use bon::Builder;
use tokio_util::sync::CancellationToken;

use crate::correlation::CorrelationId;
use crate::topic::Topic;

/// A correlated request to the handlers of `topic`.
///
/// # Example
///
/// ```ignore
/// let cancel = CancellationToken::new();
/// let request = Request::builder()
///     .topic(topics::LOGIN_SIGNIN)
///     .params(SigninParams { email, password })
///     .cancel(cancel.clone())
///     .build();
///
/// let user: User = client.request(request).await?.decode()?;
/// ```
#[derive(Debug, Builder)]
pub struct Request<P> {
    /// Also names the reply topic. Generated when not set.
    ///
    /// Must be unique among in-flight requests: requests sharing an id share a reply topic and
    /// all resolve with whichever reply arrives first.
    #[builder(default = CorrelationId::generate())]
    pub correlation_id: CorrelationId,

    /// Work queue the request is pushed on.
    #[builder(into)]
    pub topic: Topic,

    pub params: P,

    /// Overrides the client's liveness-ping interval for the reply subscription.
    pub ping_interval: Option<Duration>,

    /// Cancelling this token abandons the request.
    #[builder(default)]
    pub cancel: CancellationToken,
}

impl<P> Request<P> {
    pub fn new(topic: impl Into<Topic>, params: P) -> Self {
        Self::builder().topic(topic).params(params).build()
    }
}
