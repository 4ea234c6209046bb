pub mod ai_search;
pub mod busqueda;
pub mod publicaciones;
