#![deny(rust_2018_idioms)]

use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use hearth::rt::{EventLoop, Executor};
use hearth::web::{endpoint, App, Blueprint, Converter, Response, Target, Value};
use hearth::Server;

mod support;
use support::{connect, read_response, send_raw, serve, serve_tuned};

fn hello_app() -> App {
    let app = App::with_secret("integration-test-key");
    app.add_blueprint(Blueprint::new("hello").endpoint(endpoint(
        "/hello/{name:string}",
        |_req, args| async move { Ok(Response::text(format!("hello, {}!", args[0]))) },
    )));
    app
}

#[test]
fn get_hello_world() {
    let server = serve(hello_app);
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /hello/world HTTP/1.1\r\nhost: example\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_str(), "hello, world!");
    assert_eq!(
        response.header("content-type"),
        Some("text/plain; charset=utf-8")
    );
    assert!(response.header("set-cookie").is_none());
    assert!(response.header("date").is_some());
}

#[test]
fn missing_route_is_404() {
    let server = serve(hello_app);
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /missing HTTP/1.1\r\nhost: example\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 404);
    assert_eq!(response.body_str(), "Not Found");
    assert_eq!(response.header("content-type"), Some("text/plain"));
}

#[test]
fn int_route_rejects_non_digits() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("numbers").endpoint(endpoint(
            "/n/{x:int}",
            |_req, args| async move {
                Ok(Response::text(format!("{}", args[0].as_int().unwrap() * 2)))
            },
        )));
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /n/21 HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_str(), "42");

    stream
        .write_all(b"GET /n/12a HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 404);
}

#[test]
fn unhandled_endpoint_error_is_500() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("broken").endpoint(endpoint(
            "/hello/{name:string}",
            |_req, _args| async move {
                Err::<Response, _>(hearth::Error::msg("endpoint exploded"))
            },
        )));
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /hello/world HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 500);
    assert_eq!(response.body_str(), "Internal Server Error");
    assert_eq!(response.header("content-type"), Some("text/plain"));
}

#[test]
fn keep_alive_serves_sequential_requests_then_expires() {
    let server = serve_tuned(hello_app, |builder| {
        builder
            .keep_alive(Duration::from_millis(500))
            .keep_alive_interval(Duration::from_millis(100))
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /hello/one HTTP/1.1\r\nhost: x\r\nconnection: keep-alive\r\n\r\n")
        .unwrap();
    let first = read_response(&mut stream);
    assert_eq!(first.body_str(), "hello, one!");

    stream
        .write_all(b"GET /hello/two HTTP/1.1\r\nhost: x\r\nconnection: keep-alive\r\n\r\n")
        .unwrap();
    let second = read_response(&mut stream);
    assert_eq!(second.body_str(), "hello, two!");

    // Idle past the keep-alive budget: the sweep closes the connection.
    thread::sleep(Duration::from_millis(1200));
    let mut probe = [0u8; 16];
    assert_eq!(stream.read(&mut probe).unwrap(), 0);
}

#[test]
fn echo_reads_body_once_and_observes_end() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("echo").endpoint(endpoint(
            "/echo",
            |req, _args| async move {
                let body = req.bytes().await?;
                let second = req.read().await?;
                Ok(Response::new(200)
                    .content_type("text/plain")
                    .header(
                        &b"x-second-read"[..],
                        if second.is_none() {
                            &b"empty"[..]
                        } else {
                            &b"data"[..]
                        },
                    )
                    .body(body))
            },
        )));
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"POST /echo HTTP/1.1\r\nhost: x\r\ncontent-length: 11\r\n\r\nhello world")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 200);
    assert_eq!(response.body_str(), "hello world");
    assert_eq!(response.header("x-second-read"), Some("empty"));
}

#[test]
fn chunked_request_body_is_decoded() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("echo").endpoint(endpoint(
            "/echo",
            |req, _args| async move {
                let body = req.bytes().await?;
                Ok(Response::new(200).content_type("text/plain").body(body))
            },
        )));
        app
    });
    let raw = send_raw(
        server.addr,
        b"POST /echo HTTP/1.1\r\nhost: x\r\ntransfer-encoding: chunked\r\nconnection: close\r\n\r\n\
          5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.ends_with("hello world"), "{}", text);
}

#[test]
fn raw_sgi_app_without_content_length_is_chunked() {
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let el = EventLoop::new().unwrap();
        let server = Server::builder(el.clone())
            .listen_on(["127.0.0.1:0"])
            .serve(|_scope, _receive, send: hearth::SendHandle| async move {
                send.start(200, &[]).await.unwrap();
                send.body(true, "hel".into()).await.unwrap();
                send.body(false, "lo".into()).await.unwrap();
            });
        server.start().unwrap();
        tx.send(server.local_addrs()[0]).unwrap();
        el.block_on(server.run_forever());
    });
    let addr = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut stream = connect(addr);
    stream
        .write_all(b"GET / HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.status(), 200);
    assert_eq!(response.header("transfer-encoding"), Some("chunked"));
    assert_eq!(response.body_str(), "hello");
}

#[test]
fn pipelined_requests_answered_in_order() {
    let server = serve(hello_app);
    let mut stream = connect(server.addr);
    stream
        .write_all(
            b"GET /hello/first HTTP/1.1\r\nhost: x\r\n\r\n\
              GET /hello/second HTTP/1.1\r\nhost: x\r\n\r\n",
        )
        .unwrap();
    let first = read_response(&mut stream);
    let second = read_response(&mut stream);
    assert_eq!(first.body_str(), "hello, first!");
    assert_eq!(second.body_str(), "hello, second!");
}

#[test]
fn malformed_request_line_is_400_and_close() {
    let server = serve(hello_app);
    let raw = send_raw(server.addr, b"BLARG\r\n\r\n");
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{}", text);
    assert!(text.contains("connection: close"), "{}", text);
}

#[test]
fn oversized_head_is_413_and_close() {
    let server = serve_tuned(hello_app, |builder| builder.max_head_size(256));
    let mut raw = b"GET /hello/x HTTP/1.1\r\nhost: x\r\nx-padding: ".to_vec();
    raw.extend(std::iter::repeat(b'a').take(1024));
    raw.extend_from_slice(b"\r\n\r\n");
    let response = send_raw(server.addr, &raw);
    let text = String::from_utf8_lossy(&response);
    assert!(
        text.starts_with("HTTP/1.1 413 Payload Too Large\r\n"),
        "{}",
        text
    );
}

#[test]
fn http10_response_closes_the_connection() {
    let server = serve(hello_app);
    let raw = send_raw(server.addr, b"GET /hello/old HTTP/1.0\r\n\r\n");
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.0 200 OK\r\n"), "{}", text);
    assert!(text.ends_with("hello, old!"), "{}", text);
}

#[test]
fn connection_close_header_is_honored() {
    let server = serve(hello_app);
    let raw = send_raw(
        server.addr,
        b"GET /hello/bye HTTP/1.1\r\nhost: x\r\nconnection: close\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
    assert!(text.ends_with("hello, bye!"), "{}", text);
}

fn session_app() -> App {
    let app = App::with_secret("integration-test-key");
    app.add_blueprint(
        Blueprint::new("session")
            .endpoint(endpoint("/session/set/{value:string}", |req, args| {
                async move {
                    req.session_mut().insert("value", format!("{}", args[0]));
                    Ok(Response::text("stored"))
                }
            }))
            .endpoint(endpoint("/session/get", |req, _args| async move {
                let value = req
                    .session()
                    .get("value")
                    .and_then(|v| v.as_str().map(str::to_owned))
                    .unwrap_or_else(|| "none".to_owned());
                Ok(Response::text(value))
            })),
    );
    app
}

#[test]
fn session_round_trips_through_the_cookie() {
    let server = serve(session_app);

    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /session/set/ferris HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let set = read_response(&mut stream);
    assert_eq!(set.status(), 200);
    let cookie = set.header("set-cookie").expect("session set-cookie");
    assert!(cookie.starts_with("session="), "{}", cookie);
    let session_value = &cookie["session=".len()..];

    let mut request = Vec::new();
    request.extend_from_slice(b"GET /session/get HTTP/1.1\r\nhost: x\r\ncookie: session=");
    request.extend_from_slice(session_value.as_bytes());
    request.extend_from_slice(b"\r\n\r\n");
    stream.write_all(&request).unwrap();
    let get = read_response(&mut stream);
    assert_eq!(get.body_str(), "ferris");
    // Reads never dirty the session, so nothing is re-set.
    assert!(get.header("set-cookie").is_none());
}

#[test]
fn tampered_session_cookie_starts_empty() {
    let server = serve(session_app);
    let raw = send_raw(
        server.addr,
        b"GET /session/get HTTP/1.1\r\nhost: x\r\ncookie: session=AAAA.BBBB\r\nconnection: close\r\n\r\n",
    );
    let text = String::from_utf8_lossy(&raw);
    assert!(text.ends_with("none"), "{}", text);
}

#[test]
fn dirty_cookie_jar_is_echoed_per_entry() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("cookies").endpoint(endpoint(
            "/cookies",
            |req, _args| async move {
                req.cookies_mut().insert("b", &b"2"[..]);
                Ok(Response::text("ok"))
            },
        )));
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /cookies HTTP/1.1\r\nhost: x\r\ncookie: a=1\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    let set = response.headers.get("set-cookie").expect("set-cookie headers");
    assert_eq!(set, &vec!["a=1".to_owned(), "b=2".to_owned()]);
}

#[test]
fn error_handler_chain_local_then_blueprint() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(
            Blueprint::new("errors")
                .endpoint(
                    endpoint("/local", |_req, _args| async move {
                        Err::<Response, _>(hearth::Error::msg("local boom"))
                    })
                    .on_error(|_req, _err| async move {
                        Ok(Some(Response::text("handled locally").status(418)))
                    }),
                )
                .endpoint(endpoint("/classwide", |_req, _args| async move {
                    Err::<Response, _>(hearth::Error::msg("classwide boom"))
                }))
                .endpoint(
                    endpoint("/silenced", |_req, _args| async move {
                        Err::<Response, _>(hearth::Error::msg("quiet boom"))
                    })
                    .on_error(|_req, _err| async move { Ok(None) }),
                )
                .on_error(|_req, _err| async move {
                    Ok(Some(Response::text("handled by blueprint").status(202)))
                }),
        );
        app
    });

    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /local HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let local = read_response(&mut stream);
    assert_eq!(local.status(), 418);
    assert_eq!(local.body_str(), "handled locally");

    stream
        .write_all(b"GET /classwide HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let classwide = read_response(&mut stream);
    assert_eq!(classwide.status(), 202);
    assert_eq!(classwide.body_str(), "handled by blueprint");

    // A silencing handler yields no response, which coerces to a 500.
    stream
        .write_all(b"GET /silenced HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let silenced = read_response(&mut stream);
    assert_eq!(silenced.status(), 500);
}

#[test]
fn pre_invoke_runs_before_the_handler() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(
            Blueprint::new("hooks").endpoint(
                endpoint("/hooked", |req, _args| async move {
                    let value = req
                        .session()
                        .get("marker")
                        .and_then(|v| v.as_str().map(str::to_owned))
                        .unwrap_or_default();
                    Ok(Response::text(value))
                })
                .before_invoke(|req| async move {
                    req.session_mut().insert("marker", "pre-invoked");
                    Ok(None)
                }),
            ),
        );
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /hooked HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    let response = read_response(&mut stream);
    assert_eq!(response.body_str(), "pre-invoked");
}

#[test]
fn explicit_converters_with_default() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(
            Blueprint::new("conv")
                .endpoint(
                    endpoint("/strict/{flag:string}", |_req, args| async move {
                        Ok(Response::text(format!("{:?}", args[0].as_bool())))
                    })
                    .converters([Converter::new([Target::Bool])]),
                )
                .endpoint(
                    endpoint("/lenient/{flag:string}", |_req, args| async move {
                        Ok(Response::text(if args[0].is_none() {
                            "fell back".to_owned()
                        } else {
                            format!("{}", args[0])
                        }))
                    })
                    .converters([Converter::new([Target::Bool]).or_default(Value::None)]),
                ),
        );
        app
    });

    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /strict/true HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).body_str(), "Some(true)");

    // Unconvertible and no default: ConversionFailure surfaces as a 500.
    stream
        .write_all(b"GET /strict/banana HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).status(), 500);

    stream
        .write_all(b"GET /lenient/banana HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).body_str(), "fell back");
}

#[test]
fn idle_max_closes_a_stalled_connection() {
    let server = serve_tuned(hello_app, |builder| {
        builder
            .idle_max(Duration::from_millis(300))
            .keep_alive_interval(Duration::from_millis(100))
    });
    let mut stream = connect(server.addr);
    // Send nothing at all; the idle-max sweep should still cut us off.
    let mut probe = [0u8; 16];
    assert_eq!(stream.read(&mut probe).unwrap(), 0);
}

#[test]
fn shutdown_stops_accepting_and_releases_run_forever() {
    let (addr_tx, addr_rx) = mpsc::channel();
    let (done_tx, done_rx) = mpsc::channel();
    thread::spawn(move || {
        let el = EventLoop::new().unwrap();
        let app = hello_app();
        let server = Server::builder(el.clone())
            .listen_on(["127.0.0.1:0"])
            .serve(app.sgi());
        server.start().unwrap();
        addr_tx.send(server.local_addrs()[0]).unwrap();
        let stopper = server.clone();
        let exec = el.clone();
        el.spawn(Box::pin(async move {
            exec.sleep(Duration::from_millis(400)).await;
            stopper.shutdown();
        }));
        el.block_on(server.run_forever());
        done_tx.send(()).unwrap();
    });

    let addr = addr_rx.recv_timeout(Duration::from_secs(5)).unwrap();
    let mut stream = connect(addr);
    stream
        .write_all(b"GET /hello/alive HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).body_str(), "hello, alive!");

    done_rx
        .recv_timeout(Duration::from_secs(5))
        .expect("run_forever released");
    // The listener is gone: either the connect is refused outright, or the
    // socket is dead on arrival.
    match TcpStream::connect(addr) {
        Err(_) => {}
        Ok(mut stream) => {
            stream
                .set_read_timeout(Some(Duration::from_secs(2)))
                .unwrap();
            let mut probe = [0u8; 1];
            match stream.read(&mut probe) {
                Ok(0) | Err(_) => {}
                Ok(n) => panic!("server answered {} bytes after shutdown", n),
            }
        }
    }
}

#[test]
fn multiple_placeholders_arrive_in_template_order() {
    let server = serve(|| {
        let app = App::with_secret("integration-test-key");
        app.add_blueprint(Blueprint::new("multi").endpoint(endpoint(
            "/u/{kind:alpha}/{id:int}/profile",
            |_req, args| async move {
                Ok(Response::text(format!("{}#{}", args[0], args[1])))
            },
        )));
        app
    });
    let mut stream = connect(server.addr);
    stream
        .write_all(b"GET /u/admin/7/profile HTTP/1.1\r\nhost: x\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut stream).body_str(), "admin#7");
}
