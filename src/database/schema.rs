pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS netlocs (
        id INTEGER PRIMARY KEY,
        value TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS urls (
        id INTEGER PRIMARY KEY,
        value TEXT UNIQUE NOT NULL,
        width INTEGER,
        height INTEGER,
        netloc_id INTEGER,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(netloc_id) REFERENCES netlocs(id)
    );

    CREATE TABLE IF NOT EXISTS namespaces (
        id INTEGER PRIMARY KEY,
        value TEXT UNIQUE NOT NULL,
        hidden INTEGER NOT NULL DEFAULT 0,
        alias TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS tags (
        id INTEGER PRIMARY KEY,
        namespace_id INTEGER,
        value TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(namespace_id) REFERENCES namespaces(id)
    );

    -- NULL namespaces must collide too, so the index is over IFNULL(..).
    CREATE UNIQUE INDEX IF NOT EXISTS tags_identity
        ON tags (IFNULL(namespace_id, 0), value);

    CREATE TABLE IF NOT EXISTS url_tags (
        url_id INTEGER NOT NULL,
        tag_id INTEGER NOT NULL,
        FOREIGN KEY(url_id) REFERENCES urls(id),
        FOREIGN KEY(tag_id) REFERENCES tags(id),
        PRIMARY KEY(url_id, tag_id)
    );

    CREATE TABLE IF NOT EXISTS json_data (
        id INTEGER PRIMARY KEY,
        value TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS match_results (
        id INTEGER PRIMARY KEY,
        url_id INTEGER NOT NULL,
        thumbnail_url_id INTEGER,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(url_id) REFERENCES urls(id),
        FOREIGN KEY(thumbnail_url_id) REFERENCES urls(id)
    );

    CREATE UNIQUE INDEX IF NOT EXISTS match_results_identity
        ON match_results (url_id, IFNULL(thumbnail_url_id, 0));

    CREATE TABLE IF NOT EXISTS match_result_json_data (
        match_result_id INTEGER NOT NULL,
        json_data_id INTEGER NOT NULL,
        FOREIGN KEY(match_result_id) REFERENCES match_results(id),
        FOREIGN KEY(json_data_id) REFERENCES json_data(id),
        PRIMARY KEY(match_result_id, json_data_id)
    );

    CREATE TABLE IF NOT EXISTS search_terms (
        id INTEGER PRIMARY KEY,
        value TEXT UNIQUE NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
    );

    CREATE TABLE IF NOT EXISTS search_queries (
        id INTEGER PRIMARY KEY,
        search_term_id INTEGER NOT NULL,
        page INTEGER NOT NULL,
        mode TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(search_term_id) REFERENCES search_terms(id),
        UNIQUE(search_term_id, page, mode)
    );

    CREATE TABLE IF NOT EXISTS search_query_match_results (
        search_query_id INTEGER NOT NULL,
        match_result_id INTEGER NOT NULL,
        FOREIGN KEY(search_query_id) REFERENCES search_queries(id),
        FOREIGN KEY(match_result_id) REFERENCES match_results(id),
        PRIMARY KEY(search_query_id, match_result_id)
    );

    CREATE TABLE IF NOT EXISTS image_files (
        id INTEGER PRIMARY KEY,
        checksum TEXT UNIQUE NOT NULL,
        width INTEGER,
        height INTEGER,
        img_format TEXT,
        size INTEGER,
        thumbnail_id INTEGER,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(thumbnail_id) REFERENCES image_files(id)
    );

    CREATE TABLE IF NOT EXISTS search_images (
        id INTEGER PRIMARY KEY,
        img_checksum TEXT UNIQUE,
        img_url_id INTEGER UNIQUE,
        search_url TEXT,
        similar_search_url TEXT,
        size_search_url TEXT,
        img_guess TEXT,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(img_url_id) REFERENCES urls(id)
    );

    CREATE TABLE IF NOT EXISTS text_matches (
        id INTEGER PRIMARY KEY,
        search_image_id INTEGER NOT NULL,
        title TEXT NOT NULL,
        url TEXT NOT NULL,
        url_text TEXT,
        text TEXT,
        imgres_url TEXT,
        imgref_url TEXT,
        match_result_id INTEGER,
        FOREIGN KEY(search_image_id) REFERENCES search_images(id),
        FOREIGN KEY(match_result_id) REFERENCES match_results(id),
        UNIQUE(search_image_id, url, title)
    );

    CREATE TABLE IF NOT EXISTS main_similar_results (
        id INTEGER PRIMARY KEY,
        search_image_id INTEGER NOT NULL,
        title TEXT,
        search_url TEXT NOT NULL,
        FOREIGN KEY(search_image_id) REFERENCES search_images(id),
        UNIQUE(search_image_id, search_url)
    );

    CREATE TABLE IF NOT EXISTS search_image_pages (
        id INTEGER PRIMARY KEY,
        search_image_id INTEGER NOT NULL,
        search_type TEXT NOT NULL,
        page INTEGER NOT NULL DEFAULT 1,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        FOREIGN KEY(search_image_id) REFERENCES search_images(id),
        UNIQUE(search_image_id, search_type, page)
    );

    CREATE TABLE IF NOT EXISTS search_image_page_match_results (
        search_image_page_id INTEGER NOT NULL,
        match_result_id INTEGER NOT NULL,
        FOREIGN KEY(search_image_page_id) REFERENCES search_image_pages(id),
        FOREIGN KEY(match_result_id) REFERENCES match_results(id),
        PRIMARY KEY(search_image_page_id, match_result_id)
    );

    CREATE TABLE IF NOT EXISTS responses (
        id INTEGER PRIMARY KEY,
        url TEXT NOT NULL,
        method TEXT NOT NULL,
        kwargs TEXT NOT NULL,
        status INTEGER NOT NULL,
        final_url TEXT NOT NULL,
        text TEXT NOT NULL,
        json TEXT,
        headers TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
        UNIQUE(url, method, kwargs)
    );
";
