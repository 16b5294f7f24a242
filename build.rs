/// Build script para proyectos ESP-IDF.
///
/// `embuild::espidf::sysenv::output()` propaga al crate las variables que
/// deja esp-idf-sys (cfg, link args, path del SDK). Solo tiene sentido
/// cuando compilamos para el ESP32: en el host el núcleo se compila y se
/// testea sin el SDK de C.
fn main() {
    if std::env::var("CARGO_CFG_TARGET_OS").as_deref() == Ok("espidf") {
        embuild::espidf::sysenv::output();
    }
}
