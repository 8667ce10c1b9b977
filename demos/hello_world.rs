use pixie_web::{Method, Response, Router, Server, Strategy};

fn main() {
    let mut router = Router::new();
    router.register(
        Method::Get,
        "/",
        Strategy::inline(|_, _| Ok(Response::new("Hello World!"))),
    );

    Server::builder()
        .bind("127.0.0.1:8080".parse().unwrap())
        .unwrap()
        .router(router)
        .build()
        .run()
        .unwrap();
}
