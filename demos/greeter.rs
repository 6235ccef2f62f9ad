//! Greeter - example of a service with all four calling conventions.
//!
//! This example demonstrates:
//! - Registering methods with declared request/response schemas
//! - A resource dependency released after every call
//! - A timing middleware and a custom exception handler
//! - Driving calls through the in-memory transport
//!
//! # Running
//!
//! ```text
//! RUST_LOG=info cargo run --example greeter
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use rpc_dispatch::dependency::Dependency;
use rpc_dispatch::middleware::{self, Call, UnaryNext};
use rpc_dispatch::scheduler::Scheduler;
use rpc_dispatch::transport::mem::LocalCall;
use rpc_dispatch::transport::{MethodDescriptor, ServiceDescriptor};
use rpc_dispatch::{
    BoxError, CallContext, Code, Controller, Message, Method, MethodMode, Resolved, Schema,
    Streaming, ValidationError,
};
use serde::{Deserialize, Serialize};

/// Request for every greeter method.
#[derive(Serialize, Deserialize, Debug)]
struct HelloRequest {
    name: String,
}

impl Schema for HelloRequest {
    const NAME: &'static str = "HelloRequest";

    fn validate(&self) -> Result<(), ValidationError> {
        if self.name.is_empty() {
            return Err(ValidationError::new("name must not be empty").at(["name"]));
        }
        Ok(())
    }
}

/// Reply for every greeter method.
#[derive(Serialize, Deserialize, Debug)]
struct HelloReply {
    message: String,
}

impl Schema for HelloReply {
    const NAME: &'static str = "HelloReply";
}

#[derive(Debug, thiserror::Error)]
#[error("{0} is not welcome here")]
struct Banned(String);

/// Stand-in for a pooled connection.
struct Session {
    id: u32,
}

fn descriptor() -> ServiceDescriptor {
    let method = |name: &str, mode| {
        MethodDescriptor::new("", name, mode, "greeter.HelloRequest", "greeter.HelloReply")
    };
    ServiceDescriptor::new("greeter.Greeter")
        .method(method("SayHello", MethodMode::UnaryUnary))
        .method(method("SayHelloGroup", MethodMode::StreamUnary))
        .method(method("SayHelloRepeat", MethodMode::UnaryStream))
        .method(method("SayHelloChat", MethodMode::StreamStream))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let session = Dependency::resource(
        "session",
        |_| async { Ok(Session { id: 1 }) },
        |session: Arc<Session>| async move {
            tracing::info!("session {} released", session.id);
            Ok(())
        },
    );

    let mut controller = Controller::new("Greeter")
        .package("greeter")
        .scheduler(Scheduler::current().ok_or("no runtime")?);

    controller
        .register(
            Method::unary_unary("say_hello", {
                let session = session.clone();
                move |req: HelloRequest, ctx: CallContext, deps: Resolved| {
                    let session = deps.get(&session);
                    async move {
                        if req.name == "mallory" {
                            return Err(Banned(req.name).into());
                        }
                        if let Some(scheduler) = ctx.scheduler() {
                            let name = req.name.clone();
                            scheduler.spawn_after(Duration::from_millis(5), async move {
                                tracing::info!("follow-up greeting sent to {}", name);
                            });
                        }
                        Ok::<_, BoxError>(HelloReply {
                            message: format!("Hello {} (session {})", req.name, session?.id),
                        })
                    }
                }
            })
            .depends_on(&session)
            .description("Greet one person"),
        )?
        .register(Method::stream_unary(
            "say_hello_group",
            |requests: Streaming<HelloRequest>, _ctx, _deps| async move {
                let mut names = Vec::new();
                let mut requests = requests;
                while let Some(request) = requests.next().await {
                    names.push(request?.name);
                }
                Ok::<_, BoxError>(HelloReply {
                    message: format!("SayHello: {}", names.join(" ")),
                })
            },
        ))?
        .register(Method::unary_stream(
            "say_hello_repeat",
            |req: HelloRequest, _ctx, _deps| {
                stream::iter(0..3).map(move |i| {
                    Ok::<_, BoxError>(HelloReply {
                        message: format!("SayHello: {} {}", req.name, i),
                    })
                })
            },
        ))?
        .register(Method::stream_stream(
            "say_hello_chat",
            |requests: Streaming<HelloRequest>, _ctx, _deps| {
                requests.map(|request| {
                    Ok::<_, BoxError>(HelloReply {
                        message: format!("Hi {}", request?.name),
                    })
                })
            },
        ))?;

    controller
        .add_middleware([middleware::from_fn(|call: Call, next: UnaryNext| async move {
            let ctx = call.context.clone();
            let result = next.run(call).await;
            tracing::info!("timing: {} us", ctx.elapsed().as_micros());
            result
        })])
        .on_exception(|_request, ctx: CallContext, err: &Banned| {
            let message = err.to_string();
            async move { ctx.abort(Code::PermissionDenied, message).await }
        });

    let service = controller.descriptor(descriptor()).build()?;
    let hello = |name: &str| {
        Message::encode(
            "greeter.HelloRequest",
            &HelloRequest {
                name: name.to_string(),
            },
        )
    };
    let peer = || Arc::new(LocalCall::new("ipv4:127.0.0.1:50051"));

    let say_hello = service.method("SayHello").ok_or("SayHello missing")?;
    let reply = say_hello.unary_unary(hello("World")?, peer()).await?;
    println!("{}", reply.decode::<HelloReply>()?.message);

    match say_hello.unary_unary(hello("mallory")?, peer()).await {
        Ok(_) => println!("mallory got in"),
        Err(status) => println!("mallory: {}", status),
    }
    match say_hello.unary_unary(hello("")?, peer()).await {
        Ok(_) => println!("empty name accepted"),
        Err(status) => println!("empty name: {}", status),
    }

    let group = stream::iter(vec![Ok(hello("A")?), Ok(hello("B")?)]).boxed();
    let reply = service
        .method("SayHelloGroup")
        .ok_or("SayHelloGroup missing")?
        .stream_unary(group, peer())
        .await?;
    println!("{}", reply.decode::<HelloReply>()?.message);

    let mut replies = service
        .method("SayHelloRepeat")
        .ok_or("SayHelloRepeat missing")?
        .unary_stream(hello("X")?, peer());
    while let Some(reply) = replies.next().await {
        println!("{}", reply?.decode::<HelloReply>()?.message);
    }

    let chat = stream::iter(vec![Ok(hello("a")?), Ok(hello("b")?)]).boxed();
    let mut replies = service
        .method("SayHelloChat")
        .ok_or("SayHelloChat missing")?
        .stream_stream(chat, peer());
    while let Some(reply) = replies.next().await {
        println!("{}", reply?.decode::<HelloReply>()?.message);
    }

    // let the scheduled follow-ups run
    tokio::time::sleep(Duration::from_millis(20)).await;
    Ok(())
}
