//! server.rs
//! Minimal REST surface over tiny_http, one handler thread per
//! request. All responses are JSON except `/download` (raw bytes) and
//! the `/config` page (HTML). The heavy lifting lives in the session
//! controller; handlers only translate between HTTP and its API.

use std::fs::File;
use std::io::Read;
use std::sync::Arc;
use std::thread;

use log::{error, info};
use serde::Serialize;
use serde_json::json;
use tiny_http::{Header, Method, Request, Response, Server};

use crate::error::{StartError, StopError};
use crate::session::{SessionController, StartRequest, CONFIG_FILES};
use crate::web::files::{self, FileAccessError};

/// Binds the listener and serves forever. A failed bind is fatal for
/// the process (non-zero exit), there is nothing to run without it.
pub fn serve(controller: Arc<SessionController>, port: u16) -> ! {
    let server = match Server::http(("0.0.0.0", port)) {
        Ok(server) => server,
        Err(e) => {
            error!("[Web] failed to bind port {port}: {e}");
            std::process::exit(1);
        }
    };
    info!("[Web] control surface on http://0.0.0.0:{port}");
    run(server, controller)
}

pub fn run(server: Server, controller: Arc<SessionController>) -> ! {
    loop {
        let request = match server.recv() {
            Ok(request) => request,
            Err(e) => {
                error!("[Web] accept error: {e}");
                continue;
            }
        };
        let controller = controller.clone();
        thread::spawn(move || handle(controller, request));
    }
}

fn handle(controller: Arc<SessionController>, request: Request) {
    let url = request.url().to_string();
    let (path, query) = match url.split_once('?') {
        Some((p, q)) => (p.to_string(), q.to_string()),
        None => (url, String::new()),
    };

    match (request.method().clone(), path.as_str()) {
        (Method::Get, "/data") => respond_json(request, 200, &controller.poll_data()),
        (Method::Get, "/status") => respond_json(request, 200, &controller.status()),
        (Method::Post, "/start") => handle_start(controller, request),
        (Method::Post, "/stop") => match controller.stop() {
            Ok(()) => respond_json(
                request,
                200,
                &json!({"success": true, "message": "collection stopped"}),
            ),
            Err(e @ StopError::NotRunning) => {
                respond_json(request, 409, &json!({"success": false, "message": e.to_string()}))
            }
        },
        (Method::Get, "/config") => respond_html(request, config_page(&controller)),
        (Method::Post, "/config") => handle_config_write(controller, request),
        (Method::Get, "/files") => handle_files(controller, request, &query),
        (Method::Get, "/download") => handle_download(controller, request, &query),
        _ => respond_json(
            request,
            404,
            &json!({"success": false, "message": "not found"}),
        ),
    }
}

fn handle_start(controller: Arc<SessionController>, mut request: Request) {
    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        return respond_json(
            request,
            400,
            &json!({"success": false, "message": "unreadable request body"}),
        );
    }
    let req: StartRequest = match serde_json::from_str(&body) {
        Ok(req) => req,
        Err(e) => {
            return respond_json(
                request,
                400,
                &json!({"success": false, "message": format!("invalid start request: {e}")}),
            )
        }
    };

    match controller.start(&req) {
        Ok(()) => respond_json(
            request,
            200,
            &json!({"success": true, "message": "collection started"}),
        ),
        Err(e) => {
            let status = match &e {
                StartError::Busy => 409,
                StartError::Config(_) => 400,
                _ => 500,
            };
            respond_json(
                request,
                status,
                &json!({"success": false, "message": e.to_string()}),
            )
        }
    }
}

#[derive(serde::Deserialize)]
struct ConfigWrite {
    file: String,
    content: String,
}

fn handle_config_write(controller: Arc<SessionController>, mut request: Request) {
    let mut body = String::new();
    if request.as_reader().read_to_string(&mut body).is_err() {
        return respond_json(
            request,
            400,
            &json!({"success": false, "message": "unreadable request body"}),
        );
    }
    let write: ConfigWrite = match serde_json::from_str(&body) {
        Ok(w) => w,
        Err(e) => {
            return respond_json(
                request,
                400,
                &json!({"success": false, "message": format!("invalid config request: {e}")}),
            )
        }
    };

    match controller.write_config_file(&write.file, &write.content) {
        Ok(()) => respond_json(
            request,
            200,
            &json!({"success": true, "message": format!("{} updated", write.file)}),
        ),
        Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => {
            respond_json(request, 400, &json!({"success": false, "message": e.to_string()}))
        }
        Err(e) => respond_json(request, 500, &json!({"success": false, "message": e.to_string()})),
    }
}

fn handle_files(controller: Arc<SessionController>, request: Request, query: &str) {
    let rel = query_param(query, "path").unwrap_or_default();
    let base = controller.output_root();
    let _ = std::fs::create_dir_all(&base);

    match files::resolve(&base, &rel) {
        Ok(dir) if dir.is_dir() => match files::list(&dir) {
            Ok(entries) => respond_json(
                request,
                200,
                &json!({"success": true, "path": rel, "entries": entries}),
            ),
            Err(e) => respond_json(
                request,
                500,
                &json!({"success": false, "message": e.to_string()}),
            ),
        },
        Ok(_) => respond_json(
            request,
            400,
            &json!({"success": false, "message": "not a directory"}),
        ),
        Err(e) => respond_file_error(request, e),
    }
}

fn handle_download(controller: Arc<SessionController>, request: Request, query: &str) {
    let rel = query_param(query, "path").unwrap_or_default();
    let base = controller.output_root();

    match files::resolve(&base, &rel) {
        Ok(path) if path.is_file() => {
            let file = match File::open(&path) {
                Ok(file) => file,
                Err(e) => {
                    return respond_json(
                        request,
                        500,
                        &json!({"success": false, "message": e.to_string()}),
                    )
                }
            };
            let filename = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| "download".to_string());
            let response = with_header(
                with_header(
                    Response::from_file(file),
                    "Content-Type",
                    "application/octet-stream",
                ),
                "Content-Disposition",
                &format!("attachment; filename=\"{filename}\""),
            );
            let _ = request.respond(response);
        }
        Ok(_) => respond_json(
            request,
            400,
            &json!({"success": false, "message": "not a file"}),
        ),
        Err(e) => respond_file_error(request, e),
    }
}

fn respond_file_error(request: Request, e: FileAccessError) {
    match e {
        FileAccessError::Escape => respond_json(
            request,
            403,
            &json!({"success": false, "message": "path escapes the output directory"}),
        ),
        FileAccessError::NotFound => respond_json(
            request,
            404,
            &json!({"success": false, "message": "no such file or directory"}),
        ),
    }
}

fn config_page(controller: &SessionController) -> String {
    let mut page = String::from(
        "<!DOCTYPE html><html><head><title>PET-7H24M configuration</title></head><body>\n\
         <h1>Configuration</h1>\n",
    );
    for name in CONFIG_FILES {
        let content = controller
            .read_config_file(name)
            .unwrap_or_else(|| "(missing)".to_string());
        page.push_str(&format!(
            "<h2>{}</h2>\n<pre>{}</pre>\n",
            escape_html(name),
            escape_html(&content)
        ));
    }
    page.push_str(
        "<p>POST /config with <code>{\"file\": ..., \"content\": ...}</code> to update.</p>\n\
         </body></html>\n",
    );
    page
}

fn respond_json<T: Serialize>(request: Request, status: u16, payload: &T) {
    let body = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    let response = with_header(
        Response::from_string(body).with_status_code(status),
        "Content-Type",
        "application/json",
    );
    let _ = request.respond(response);
}

fn respond_html(request: Request, body: String) {
    let response = with_header(
        Response::from_string(body),
        "Content-Type",
        "text/html; charset=utf-8",
    );
    let _ = request.respond(response);
}

fn with_header<R: Read>(response: Response<R>, name: &str, value: &str) -> Response<R> {
    match Header::from_bytes(name.as_bytes(), value.as_bytes()) {
        Ok(header) => response.with_header(header),
        Err(()) => response,
    }
}

fn query_param(query: &str, key: &str) -> Option<String> {
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == key).then(|| percent_decode(v))
    })
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = &s[i + 1..i + 3];
                match u8::from_str_radix(hex, 16) {
                    Ok(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    Err(_) => out.push(b'%'),
                }
            }
            b'+' => out.push(b' '),
            byte => out.push(byte),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn escape_html(s: &str) -> String {
    s.replace('&', "&amp;").replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::sim::SimTransport;
    use crate::pipeline::sql_uploader::MysqlLoader;
    use std::io::Write;
    use std::net::TcpStream;

    #[test]
    fn query_params_decode() {
        assert_eq!(query_param("path=run%20a/x.csv", "path").unwrap(), "run a/x.csv");
        assert_eq!(query_param("a=1&path=b+c", "path").unwrap(), "b c");
        assert!(query_param("a=1", "path").is_none());
        assert_eq!(percent_decode("100%"), "100%");
    }

    #[test]
    fn html_is_escaped() {
        assert_eq!(escape_html("<a&b>"), "&lt;a&amp;b&gt;");
    }

    fn spawn_server() -> (std::net::SocketAddr, Arc<SessionController>) {
        let dir = tempfile::tempdir().unwrap();
        let controller = Arc::new(SessionController::new(
            dir.path().to_path_buf(),
            SimTransport::factory(),
            MysqlLoader::factory(),
        ));
        let server = Server::http("127.0.0.1:0").expect("bind");
        let addr = match server.server_addr() {
            tiny_http::ListenAddr::IP(addr) => addr,
            _ => unreachable!("bound to an IP socket"),
        };
        // The tempdir must outlive the server thread.
        std::mem::forget(dir);
        let c = controller.clone();
        thread::spawn(move || run(server, c));
        (addr, controller)
    }

    fn http_get(addr: std::net::SocketAddr, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).expect("connect");
        write!(
            stream,
            "GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n"
        )
        .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn status_endpoint_serves_json() {
        let (addr, _controller) = spawn_server();
        let response = http_get(addr, "/status");
        assert!(response.starts_with("HTTP/1.1 200"), "{response}");
        assert!(response.contains("application/json"));
        assert!(response.contains("\"is_collecting\":false"));
    }

    #[test]
    fn path_escape_is_rejected_without_touching_disk() {
        let (addr, _controller) = spawn_server();
        for path in ["/files?path=../../etc", "/files?path=../../../../../../etc"] {
            let response = http_get(addr, path);
            // Escaping paths never produce a listing, whether the
            // normalized target exists (403) or not (404).
            assert!(response.starts_with("HTTP/1.1 4"), "{response}");
            assert!(response.contains("\"success\":false"));
            assert!(!response.contains("entries"));
        }
    }

    #[test]
    fn unknown_route_is_404() {
        let (addr, _controller) = spawn_server();
        let response = http_get(addr, "/nope");
        assert!(response.starts_with("HTTP/1.1 404"), "{response}");
    }
}
